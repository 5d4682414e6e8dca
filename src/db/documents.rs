use anyhow::{Result, anyhow};
use tokio_rusqlite::{Connection, params, rusqlite};

use crate::core::{Document, FilePart, FormCode, NewDocument, NewFilePart};

fn document_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        transfer_id: row.get(1)?,
        name: row.get(2)?,
        form: FormCode {
            form_code: row.get(3)?,
            system_code: row.get(4)?,
            schema_version: row.get(5)?,
        },
        original_file_id: row.get(6)?,
        zip_file_id: row.get(7)?,
        iv: row.get(8)?,
        original_hash: row.get(9)?,
    })
}

fn part_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FilePart> {
    Ok(FilePart {
        id: row.get(0)?,
        document_id: row.get(1)?,
        part_number: row.get(2)?,
        name: row.get(3)?,
        file_part_id: row.get(4)?,
        cloud_meta: row.get(5)?,
        blob_name: row.get(6)?,
        uploaded: row.get(7)?,
    })
}

pub async fn create(conn: &Connection, new: NewDocument) -> Result<Document> {
    let document = Document {
        id: super::new_id(),
        transfer_id: new.transfer_id,
        name: new.name,
        form: new.form,
        original_file_id: new.original_file_id,
        zip_file_id: None,
        iv: None,
        original_hash: None,
    };

    let row = document.clone();
    conn.call(move |c| {
        c.execute(
            "INSERT INTO documents
                (id, transfer_id, name, form_code, system_code, schema_version, original_file_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.id,
                row.transfer_id,
                row.name,
                row.form.form_code,
                row.form.system_code,
                row.form.schema_version,
                row.original_file_id
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(document)
}

/// Documents in the order they were added.
pub async fn list_for_transfer(conn: &Connection, transfer_id: String) -> Result<Vec<Document>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT id, transfer_id, name, form_code, system_code, schema_version,
                    original_file_id, zip_file_id, iv, original_hash
             FROM documents WHERE transfer_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![transfer_id], document_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, rusqlite::Error>(rows)
    })
    .await
    .map_err(|e| anyhow!("Failed to list documents: {}", e))
}

pub async fn set_encryption(
    conn: &Connection,
    document_id: String,
    zip_file_id: String,
    iv: String,
    original_hash: String,
) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE documents SET zip_file_id = ?2, iv = ?3, original_hash = ?4 WHERE id = ?1",
            params![document_id, zip_file_id, iv, original_hash],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

/// Drops parts, archives and IVs left behind by an interrupted prepare so it
/// can run again from scratch.
pub async fn reset_encryption(conn: &Connection, transfer_id: String) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;

        let mut stale: Vec<String> = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT p.file_part_id FROM file_parts p
                     JOIN documents d ON d.id = p.document_id WHERE d.transfer_id = ?1
                 UNION ALL
                 SELECT zip_file_id FROM documents
                     WHERE transfer_id = ?1 AND zip_file_id IS NOT NULL",
            )?;
            let rows = stmt.query_map(params![transfer_id], |row| row.get::<_, String>(0))?;
            for row in rows {
                stale.push(row?);
            }
        }

        tx.execute(
            "DELETE FROM file_parts WHERE document_id IN
                 (SELECT id FROM documents WHERE transfer_id = ?1)",
            params![transfer_id],
        )?;
        tx.execute(
            "UPDATE documents SET zip_file_id = NULL, iv = NULL, original_hash = NULL
             WHERE transfer_id = ?1",
            params![transfer_id],
        )?;
        for artifact_id in &stale {
            tx.execute("DELETE FROM artifacts WHERE id = ?1", params![artifact_id])?;
        }

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

pub async fn create_part(conn: &Connection, new: NewFilePart) -> Result<FilePart> {
    let part = FilePart {
        id: super::new_id(),
        document_id: new.document_id,
        part_number: new.part_number,
        name: new.name,
        file_part_id: new.file_part_id,
        cloud_meta: None,
        blob_name: None,
        uploaded: false,
    };

    let row = part.clone();
    conn.call(move |c| {
        c.execute(
            "INSERT INTO file_parts (id, document_id, part_number, name, file_part_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.id,
                row.document_id,
                row.part_number,
                row.name,
                row.file_part_id
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(part)
}

/// Every part of a transfer, by document order and then part number.
pub async fn parts_for_transfer(conn: &Connection, transfer_id: String) -> Result<Vec<FilePart>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT p.id, p.document_id, p.part_number, p.name, p.file_part_id,
                    p.cloud_meta, p.blob_name, p.uploaded
             FROM file_parts p JOIN documents d ON d.id = p.document_id
             WHERE d.transfer_id = ?1
             ORDER BY d.rowid, p.part_number",
        )?;
        let rows = stmt
            .query_map(params![transfer_id], part_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, rusqlite::Error>(rows)
    })
    .await
    .map_err(|e| anyhow!("Failed to list file parts: {}", e))
}

/// Flags a part as uploaded. Once set the flag is never cleared.
pub async fn mark_uploaded(conn: &Connection, part_id: String) -> Result<bool> {
    let changed = conn
        .call(move |c| {
            c.execute(
                "UPDATE file_parts SET uploaded = 1 WHERE id = ?1 AND uploaded = 0",
                params![part_id],
            )
        })
        .await?;
    Ok(changed == 1)
}
