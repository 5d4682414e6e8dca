//! JSON bodies exchanged with the e-document gateway.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitUploadResponse {
    pub reference_number: String,
    #[serde(default)]
    pub request_to_upload_file_list: Vec<UploadSlot>,
    /// Body as received, kept for the audit trail.
    #[serde(skip)]
    pub raw: String,
}

/// Short-lived authorization for one direct blob upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadSlot {
    pub file_name: String,
    pub blob_name: String,
    #[serde(default)]
    pub header_list: Vec<HeaderEntry>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FinishUploadRequest {
    pub reference_number: String,
    pub azure_blob_name_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusResponse {
    pub code: i32,
    #[serde(default)]
    pub description: Option<String>,
    /// Official receipt (UPO) XML, present once the upload is accepted.
    #[serde(default)]
    pub upo: Option<String>,
}

impl InitUploadResponse {
    pub fn parse(body: &str) -> serde_json::Result<Self> {
        let mut response: Self = serde_json::from_str(body)?;
        response.raw = body.to_string();
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_init_response() {
        let body = r#"{
            "ReferenceNumber": "f2b5e8b1000ab2c40000007a4d2f3bb1",
            "TimeoutInSec": 900,
            "RequestToUploadFileList": [{
                "BlobName": "3a8f6c1e-blob",
                "FileName": "JPK.xml.zip.001.aes",
                "Url": "https://taxdocumentstorage.blob.core.windows.net/x?sig=abc",
                "Method": "PUT",
                "HeaderList": [
                    {"Key": "Content-MD5", "Value": "q1w2e3=="},
                    {"Key": "x-ms-blob-type", "Value": "BlockBlob"}
                ]
            }]
        }"#;

        let response = InitUploadResponse::parse(body).unwrap();
        assert_eq!(response.reference_number, "f2b5e8b1000ab2c40000007a4d2f3bb1");
        assert_eq!(response.raw, body);
        let slot = &response.request_to_upload_file_list[0];
        assert_eq!(slot.file_name, "JPK.xml.zip.001.aes");
        assert_eq!(slot.header_list.len(), 2);
        assert_eq!(slot.header_list[1].value, "BlockBlob");
    }

    #[test]
    fn finish_request_uses_gateway_field_names() {
        let request = FinishUploadRequest {
            reference_number: "ref".into(),
            azure_blob_name_list: vec!["b1".into(), "b2".into()],
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"ReferenceNumber":"ref","AzureBlobNameList":["b1","b2"]}"#
        );
    }

    #[test]
    fn status_fields_are_optional() {
        let status: StatusResponse = serde_json::from_str(r#"{"Code": 120}"#).unwrap();
        assert_eq!(status.code, 120);
        assert!(status.description.is_none());
        assert!(status.upo.is_none());
    }
}
