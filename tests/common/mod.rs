#![allow(dead_code)]

use std::sync::{Arc, OnceLock};

use base64::{Engine, engine::general_purpose::STANDARD};
use jpk_transfer::{
    config::{AppConfig, TransferSettings},
    context::AppContext,
    core::{DocumentUpload, FormCode, JpkType, Transfer, TransferPipeline},
    db,
    remote::SimulatedStorage,
};
use rand::{RngCore, SeedableRng, rngs::StdRng};
use rsa::{
    RsaPrivateKey,
    pkcs8::{EncodePublicKey, LineEnding},
};
use tempfile::TempDir;

pub const KIB: u64 = 1024;

pub struct Harness {
    pub ctx: AppContext,
    pub sim: SimulatedStorage,
    pub pipeline: TransferPipeline,
    _dir: TempDir,
}

fn gateway_key() -> &'static (RsaPrivateKey, String) {
    static KEY: OnceLock<(RsaPrivateKey, String)> = OnceLock::new();
    KEY.get_or_init(|| {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        (private, pem)
    })
}

pub fn gateway_private_key() -> &'static RsaPrivateKey {
    &gateway_key().0
}

pub async fn harness(max_chunk_size: u64) -> Harness {
    harness_with(max_chunk_size, |_| {}).await
}

pub async fn harness_with(max_chunk_size: u64, configure: impl FnOnce(&mut AppConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("mf_public_key.pem");
    std::fs::write(&key_path, &gateway_key().1).unwrap();

    let mut config = AppConfig {
        simulation: true,
        status_retry_delay_ms: 1,
        settings: TransferSettings {
            endpoint_url: "https://test-e-dokumenty.mf.gov.pl".into(),
            public_key_path: Some(key_path),
            max_chunk_size,
            ..Default::default()
        },
        ..Default::default()
    };
    configure(&mut config);

    let conn = db::init_in_memory().await.unwrap();
    let sim = SimulatedStorage::new();
    let ctx = AppContext::new(config, conn, Arc::new(sim.clone()));
    let pipeline = TransferPipeline::new(ctx.clone());

    Harness {
        ctx,
        sim,
        pipeline,
        _dir: dir,
    }
}

/// Incompressible content, so archive size tracks input size.
pub fn random_bytes(len: u64, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len as usize];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

pub fn upload(file_name: &str, data: Vec<u8>) -> DocumentUpload {
    DocumentUpload {
        file_name: file_name.to_string(),
        data,
        form: FormCode::default(),
    }
}

impl Harness {
    pub async fn transfer(&self, id: &str) -> Transfer {
        self.pipeline.load(id).await.unwrap()
    }

    pub async fn draft_with(&self, documents: Vec<DocumentUpload>) -> Transfer {
        let transfer = self
            .pipeline
            .create_transfer("VAT 2024-03", JpkType::Jpk)
            .await
            .unwrap();
        for document in documents {
            self.pipeline.add_document(&transfer.id, document).await.unwrap();
        }
        transfer
    }

    /// Prepare the transfer and "sign" its metadata by attaching it as is.
    pub async fn prepare_and_sign(&self, id: &str) {
        self.pipeline.create_transfer_request(id).await.unwrap();
        let unsigned = self.pipeline.unsigned_metadata(id).await.unwrap().unwrap();
        self.pipeline
            .attach_signed_metadata(id, "signed_metadata.xml.xades", unsigned.content)
            .await
            .unwrap();
    }

    pub async fn messages(&self, id: &str) -> Vec<String> {
        db::transfers::messages(&self.ctx.db, id.to_string())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect()
    }

    pub async fn artifact_count(&self) -> i64 {
        self.ctx
            .db
            .call(|c| c.query_row("SELECT COUNT(*) FROM artifacts", [], |row| row.get::<_, i64>(0)))
            .await
            .unwrap()
    }

    /// Replace the gateway key file the pipeline reads.
    pub fn write_gateway_key(&self, pem: &str) {
        let path = self.ctx.config.settings.public_key_path.as_ref().unwrap();
        std::fs::write(path, pem).unwrap();
    }

    pub fn restore_gateway_key(&self) {
        self.write_gateway_key(&gateway_key().1);
    }

    pub async fn secret_key(&self, id: &str) -> Vec<u8> {
        let transfer = self.transfer(id).await;
        STANDARD.decode(transfer.secret_key.unwrap()).unwrap()
    }
}
