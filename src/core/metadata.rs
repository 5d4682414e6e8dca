//! InitUpload metadata rendering.
//!
//! Rendering is a pure function of a template and its context; the output
//! is handed to an external signer before it reaches the gateway.

use std::fmt::Write;

use super::encryptor::PART_DIGEST_ALGORITHM;
use super::models::{FormCode, JpkType};

const NAMESPACE: &str = "http://e-dokumenty.mf.gov.pl";
const METADATA_VERSION: &str = "01.02.01.20160617";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    InitUpload,
}

impl Template {
    /// Name under which the rendered document is stored.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::InitUpload => "unsigned_metadata.xml",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitUploadContext {
    pub jpk_type: JpkType,
    /// Transfer key wrapped with the gateway public key, base64.
    pub encryption_key: String,
    pub key_bits: usize,
    pub block_size: usize,
    pub iv_size: usize,
    pub documents: Vec<DocumentEntry>,
}

#[derive(Debug, Clone)]
pub struct DocumentEntry {
    pub form: FormCode,
    pub file_name: String,
    pub content_length: u64,
    /// Base64 SHA-256 of the original file.
    pub hash: String,
    /// Base64 IV used for every part of this document.
    pub iv: String,
    pub parts: Vec<PartEntry>,
}

#[derive(Debug, Clone)]
pub struct PartEntry {
    pub ordinal: u32,
    pub file_name: String,
    pub content_length: u64,
    pub hash: String,
}

pub fn render(template: Template, context: &InitUploadContext) -> String {
    match template {
        Template::InitUpload => render_init_upload(context),
    }
}

fn render_init_upload(ctx: &InitUploadContext) -> String {
    let mut xml = String::with_capacity(2048);

    // fmt::Write into a String cannot fail
    let _ = writeln!(xml, r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    let _ = writeln!(xml, r#"<InitUpload xmlns="{NAMESPACE}">"#);
    let _ = writeln!(xml, "  <DocumentType>{}</DocumentType>", ctx.jpk_type.as_str());
    let _ = writeln!(xml, "  <Version>{METADATA_VERSION}</Version>");
    let _ = writeln!(
        xml,
        r#"  <EncryptionKey algorithm="RSA" mode="ECB" padding="PKCS#1" encoding="Base64">{}</EncryptionKey>"#,
        escape(&ctx.encryption_key)
    );
    let _ = writeln!(xml, "  <DocumentList>");

    for doc in &ctx.documents {
        let _ = writeln!(xml, "    <Document>");
        let _ = writeln!(
            xml,
            r#"      <FormCode systemCode="{}" schemaVersion="{}">{}</FormCode>"#,
            escape(&doc.form.system_code),
            escape(&doc.form.schema_version),
            escape(&doc.form.form_code)
        );
        let _ = writeln!(xml, "      <FileName>{}</FileName>", escape(&doc.file_name));
        let _ = writeln!(xml, "      <ContentLength>{}</ContentLength>", doc.content_length);
        let _ = writeln!(
            xml,
            r#"      <HashValue algorithm="SHA-256" encoding="Base64">{}</HashValue>"#,
            escape(&doc.hash)
        );
        let _ = writeln!(
            xml,
            r#"      <FileSignatureList filesNumber="{}">"#,
            doc.parts.len()
        );
        let _ = writeln!(xml, "        <Packaging>");
        let _ = writeln!(xml, r#"          <SplitZip type="split" mode="zip"/>"#);
        let _ = writeln!(xml, "        </Packaging>");
        let _ = writeln!(xml, "        <Encryption>");
        let _ = writeln!(
            xml,
            r#"          <AES size="{}" block="{}" mode="CBC" padding="PKCS#7">"#,
            ctx.key_bits, ctx.block_size
        );
        let _ = writeln!(
            xml,
            r#"            <IV bytes="{}" encoding="Base64">{}</IV>"#,
            ctx.iv_size,
            escape(&doc.iv)
        );
        let _ = writeln!(xml, "          </AES>");
        let _ = writeln!(xml, "        </Encryption>");

        for part in &doc.parts {
            let _ = writeln!(xml, "        <FileSignature>");
            let _ = writeln!(xml, "          <OrdinalNumber>{}</OrdinalNumber>", part.ordinal);
            let _ = writeln!(xml, "          <FileName>{}</FileName>", escape(&part.file_name));
            let _ = writeln!(
                xml,
                "          <ContentLength>{}</ContentLength>",
                part.content_length
            );
            let _ = writeln!(
                xml,
                r#"          <HashValue algorithm="{PART_DIGEST_ALGORITHM}" encoding="Base64">{}</HashValue>"#,
                escape(&part.hash)
            );
            let _ = writeln!(xml, "        </FileSignature>");
        }

        let _ = writeln!(xml, "      </FileSignatureList>");
        let _ = writeln!(xml, "    </Document>");
    }

    let _ = writeln!(xml, "  </DocumentList>");
    let _ = writeln!(xml, "</InitUpload>");
    xml
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> InitUploadContext {
        InitUploadContext {
            jpk_type: JpkType::Jpk,
            encryption_key: "d3JhcHBlZA==".into(),
            key_bits: 256,
            block_size: 16,
            iv_size: 16,
            documents: vec![DocumentEntry {
                form: FormCode::default(),
                file_name: "R&D_V7M.xml".into(),
                content_length: 1200,
                hash: "aGFzaA==".into(),
                iv: "aXY=".into(),
                parts: vec![
                    PartEntry {
                        ordinal: 1,
                        file_name: "R&D_V7M.xml.zip.001.aes".into(),
                        content_length: 64,
                        hash: "cDE=".into(),
                    },
                    PartEntry {
                        ordinal: 2,
                        file_name: "R&D_V7M.xml.zip.002.aes".into(),
                        content_length: 32,
                        hash: "cDI=".into(),
                    },
                ],
            }],
        }
    }

    #[test]
    fn declares_documents_and_parts() {
        let xml = render(Template::InitUpload, &context());

        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<DocumentType>JPK</DocumentType>"));
        assert!(xml.contains(r#"encoding="Base64">d3JhcHBlZA==</EncryptionKey>"#));
        assert!(xml.contains(r#"<FormCode systemCode="JPK_V7M (1)" schemaVersion="1-2E">JPK_VAT</FormCode>"#));
        assert!(xml.contains(r#"<FileSignatureList filesNumber="2">"#));
        assert!(xml.contains(r#"<AES size="256" block="16" mode="CBC" padding="PKCS#7">"#));
        assert!(xml.contains(r#"<HashValue algorithm="MD5" encoding="Base64">cDI=</HashValue>"#));
        assert_eq!(xml.matches("<FileSignature>").count(), 2);
    }

    #[test]
    fn escapes_markup_in_values() {
        let xml = render(Template::InitUpload, &context());
        assert!(xml.contains("<FileName>R&amp;D_V7M.xml</FileName>"));
        assert!(!xml.contains("R&D"));
    }

    #[test]
    fn ad_hoc_type_is_declared() {
        let mut ctx = context();
        ctx.jpk_type = JpkType::Jpkah;
        assert!(render(Template::InitUpload, &ctx).contains("<DocumentType>JPKAH</DocumentType>"));
    }

    #[test]
    fn template_names() {
        assert_eq!(Template::InitUpload.file_name(), "unsigned_metadata.xml");
    }
}
