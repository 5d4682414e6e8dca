use anyhow::{Result, anyhow};
use tokio_rusqlite::{Connection, params, rusqlite, rusqlite::OptionalExtension};

use crate::core::{
    NewTransfer, SlotAssignment, Transfer, TransferMessage, TransferState, Transition,
};

const COLUMNS: &str = "id, name, jpk_type, state, active, secret_key, reference_number,
    last_description, error_description, initial_response, unsigned_metadata_id,
    signed_metadata_id, confirmation_id, created_at";

fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transfer> {
    Ok(Transfer {
        id: row.get(0)?,
        name: row.get(1)?,
        jpk_type: row.get(2)?,
        state: row.get(3)?,
        active: row.get(4)?,
        secret_key: row.get(5)?,
        reference_number: row.get(6)?,
        last_description: row.get(7)?,
        error_description: row.get(8)?,
        initial_response: row.get(9)?,
        unsigned_metadata_id: row.get(10)?,
        signed_metadata_id: row.get(11)?,
        confirmation_id: row.get(12)?,
        created_at: row.get(13)?,
    })
}

pub async fn create(conn: &Connection, new: NewTransfer) -> Result<Transfer> {
    let transfer = Transfer {
        id: super::new_id(),
        name: new.name,
        jpk_type: new.jpk_type,
        state: TransferState::Draft,
        active: true,
        secret_key: None,
        reference_number: None,
        last_description: None,
        error_description: None,
        initial_response: None,
        unsigned_metadata_id: None,
        signed_metadata_id: None,
        confirmation_id: None,
        created_at: super::now(),
    };

    let row = transfer.clone();
    conn.call(move |c| {
        c.execute(
            "INSERT INTO transfers (id, name, jpk_type, state, active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![row.id, row.name, row.jpk_type, row.state, row.created_at],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;

    Ok(transfer)
}

pub async fn get(conn: &Connection, id: String) -> Result<Option<Transfer>> {
    conn.call(move |c| {
        c.query_row(
            &format!("SELECT {COLUMNS} FROM transfers WHERE id = ?1"),
            params![id],
            from_row,
        )
        .optional()
    })
    .await
    .map_err(|e| anyhow!("Failed to get transfer: {}", e))
}

/// Newest first. Archived transfers are hidden unless `include_archived`.
pub async fn list(
    conn: &Connection,
    state: Option<TransferState>,
    include_archived: bool,
) -> Result<Vec<Transfer>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(&format!(
            "SELECT {COLUMNS} FROM transfers
             WHERE (?1 IS NULL OR state = ?1) AND (?2 OR active = 1)
             ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt
            .query_map(params![state, include_archived], from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, rusqlite::Error>(rows)
    })
    .await
    .map_err(|e| anyhow!("Failed to list transfers: {}", e))
}

/// Ids of active transfers in `state`, oldest first.
pub async fn ids_in_state(conn: &Connection, state: TransferState) -> Result<Vec<String>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT id FROM transfers WHERE state = ?1 AND active = 1
             ORDER BY created_at, rowid",
        )?;
        let ids = stmt
            .query_map(params![state], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, rusqlite::Error>(ids)
    })
    .await
    .map_err(|e| anyhow!("Failed to list transfer ids: {}", e))
}

/// Current state of `id` and the state `event` leads to from there, or
/// `None` when the transfer is missing or the event is not legal for it.
fn resolve(
    c: &rusqlite::Connection,
    id: &str,
    event: Transition,
) -> rusqlite::Result<Option<(TransferState, TransferState)>> {
    let current: Option<TransferState> = c
        .query_row("SELECT state FROM transfers WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(current.and_then(|from| from.next(event).map(|to| (from, to))))
}

/// Applies `event`. Returns false when it is not legal in the current state.
pub async fn transition(conn: &Connection, id: String, event: Transition) -> Result<bool> {
    conn.call(move |c| -> rusqlite::Result<bool> {
        let tx = c.transaction()?;
        let Some((from, to)) = resolve(&tx, &id, event)? else {
            return Ok(false);
        };
        let changed = tx.execute(
            "UPDATE transfers SET state = ?3 WHERE id = ?1 AND state = ?2",
            params![id, from, to],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    })
    .await
    .map_err(|e| anyhow!("Failed to apply {:?}: {}", event, e))
}

/// Records the transfer key and unsigned metadata and applies
/// [`Transition::Initialized`].
pub async fn mark_prepared(
    conn: &Connection,
    id: String,
    secret_key: String,
    unsigned_metadata_id: String,
) -> Result<bool> {
    conn.call(move |c| -> rusqlite::Result<bool> {
        let tx = c.transaction()?;
        let Some((from, to)) = resolve(&tx, &id, Transition::Initialized)? else {
            return Ok(false);
        };
        let changed = tx.execute(
            "UPDATE transfers
             SET state = ?3, secret_key = ?4, unsigned_metadata_id = ?5
             WHERE id = ?1 AND state = ?2",
            params![id, from, to, secret_key, unsigned_metadata_id],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    })
    .await
    .map_err(|e| anyhow!("Failed to mark transfer prepared: {}", e))
}

pub async fn set_signed_metadata(
    conn: &Connection,
    id: String,
    artifact_id: String,
) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE transfers SET signed_metadata_id = ?2 WHERE id = ?1",
            params![id, artifact_id],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

/// Stores the init answer and the slot issued for every part atomically.
pub async fn record_init_response(
    conn: &Connection,
    id: String,
    reference_number: String,
    raw_response: String,
    slots: Vec<SlotAssignment>,
) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;

        tx.execute(
            "UPDATE transfers SET reference_number = ?2, initial_response = ?3 WHERE id = ?1",
            params![id, reference_number, raw_response],
        )?;

        for slot in &slots {
            tx.execute(
                "UPDATE file_parts SET cloud_meta = ?2, blob_name = ?3 WHERE id = ?1",
                params![slot.part_id, slot.cloud_meta, slot.blob_name],
            )?;
        }

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

pub async fn set_last_description(
    conn: &Connection,
    id: String,
    description: String,
) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE transfers SET last_description = ?2 WHERE id = ?1",
            params![id, description],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

/// Links the confirmation and applies [`Transition::PollConfirmed`].
pub async fn confirm(conn: &Connection, id: String, confirmation_id: String) -> Result<bool> {
    conn.call(move |c| -> rusqlite::Result<bool> {
        let tx = c.transaction()?;
        let Some((from, to)) = resolve(&tx, &id, Transition::PollConfirmed)? else {
            return Ok(false);
        };
        let changed = tx.execute(
            "UPDATE transfers SET state = ?3, confirmation_id = ?4
             WHERE id = ?1 AND state = ?2",
            params![id, from, to, confirmation_id],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    })
    .await
    .map_err(|e| anyhow!("Failed to confirm transfer: {}", e))
}

/// Applies [`Transition::PollDeclined`]. A `None` description leaves any
/// previous one in place.
pub async fn decline(
    conn: &Connection,
    id: String,
    error_description: Option<String>,
) -> Result<bool> {
    conn.call(move |c| -> rusqlite::Result<bool> {
        let tx = c.transaction()?;
        let Some((from, to)) = resolve(&tx, &id, Transition::PollDeclined)? else {
            return Ok(false);
        };
        let changed = tx.execute(
            "UPDATE transfers
             SET state = ?3, error_description = COALESCE(?4, error_description)
             WHERE id = ?1 AND state = ?2",
            params![id, from, to, error_description],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    })
    .await
    .map_err(|e| anyhow!("Failed to decline transfer: {}", e))
}

pub async fn set_error_description(
    conn: &Connection,
    id: String,
    description: String,
) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE transfers SET error_description = ?2 WHERE id = ?1",
            params![id, description],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

pub async fn set_active(conn: &Connection, id: String, active: bool) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "UPDATE transfers SET active = ?2 WHERE id = ?1",
            params![id, active],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

/// Removes the transfer, its documents, parts, messages and every artifact
/// they own.
pub async fn delete(conn: &Connection, id: String) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;

        let mut owned: Vec<String> = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT unsigned_metadata_id FROM transfers WHERE id = ?1
                 UNION ALL SELECT signed_metadata_id FROM transfers WHERE id = ?1
                 UNION ALL SELECT confirmation_id FROM transfers WHERE id = ?1
                 UNION ALL SELECT original_file_id FROM documents WHERE transfer_id = ?1
                 UNION ALL SELECT zip_file_id FROM documents WHERE transfer_id = ?1
                 UNION ALL SELECT p.file_part_id FROM file_parts p
                     JOIN documents d ON d.id = p.document_id WHERE d.transfer_id = ?1",
            )?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, Option<String>>(0))?;
            for row in rows {
                if let Some(artifact_id) = row? {
                    owned.push(artifact_id);
                }
            }
        }

        tx.execute("DELETE FROM transfers WHERE id = ?1", params![id])?;
        for artifact_id in &owned {
            tx.execute("DELETE FROM artifacts WHERE id = ?1", params![artifact_id])?;
        }

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

pub async fn add_message(conn: &Connection, transfer_id: String, body: String) -> Result<()> {
    conn.call(move |c| {
        c.execute(
            "INSERT INTO transfer_messages (id, transfer_id, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![super::new_id(), transfer_id, body, super::now()],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

pub async fn messages(conn: &Connection, transfer_id: String) -> Result<Vec<TransferMessage>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT id, transfer_id, body, created_at FROM transfer_messages
             WHERE transfer_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map(params![transfer_id], |row| {
                Ok(TransferMessage {
                    id: row.get(0)?,
                    transfer_id: row.get(1)?,
                    body: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok::<_, rusqlite::Error>(rows)
    })
    .await
    .map_err(|e| anyhow!("Failed to read transfer messages: {}", e))
}
