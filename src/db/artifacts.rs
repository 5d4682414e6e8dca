use anyhow::{Result, anyhow};
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::Artifact;

#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub name: String,
    pub content: Vec<u8>,
    pub hash: Option<String>,
}

impl NewArtifact {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content,
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

pub async fn create(conn: &Connection, artifact: NewArtifact) -> Result<String> {
    let id = super::new_id();
    let created_at = super::now();
    let artifact_id = id.clone();

    conn.call(move |c| {
        c.execute(
            "INSERT INTO artifacts (id, name, content, hash, size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                artifact_id,
                artifact.name,
                artifact.content,
                artifact.hash,
                artifact.content.len() as i64,
                created_at
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(id)
}

pub async fn get(conn: &Connection, id: String) -> Result<Artifact> {
    conn.call(move |c| {
        c.query_row(
            "SELECT id, name, content, hash, size FROM artifacts WHERE id = ?1",
            params![id],
            |row| {
                Ok(Artifact {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    content: row.get(2)?,
                    hash: row.get(3)?,
                    size: row.get::<_, i64>(4)? as u64,
                })
            },
        )
    })
    .await
    .map_err(|e| anyhow!("Failed to get artifact: {}", e))
}

pub async fn content(conn: &Connection, id: String) -> Result<Vec<u8>> {
    conn.call(move |c| {
        c.query_row(
            "SELECT content FROM artifacts WHERE id = ?1",
            params![id],
            |row| row.get::<_, Vec<u8>>(0),
        )
    })
    .await
    .map_err(|e| anyhow!("Failed to read artifact content: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stores_and_reads_back() {
        let conn = crate::db::init_in_memory().await.unwrap();

        let id = create(
            &conn,
            NewArtifact::new("part.aes", vec![1, 2, 3]).with_hash("digest"),
        )
        .await
        .unwrap();

        let artifact = get(&conn, id.clone()).await.unwrap();
        assert_eq!(artifact.name, "part.aes");
        assert_eq!(artifact.size, 3);
        assert_eq!(artifact.hash.as_deref(), Some("digest"));
        assert_eq!(content(&conn, id).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn missing_artifact_is_an_error() {
        let conn = crate::db::init_in_memory().await.unwrap();
        assert!(get(&conn, "nope".into()).await.is_err());
    }
}
