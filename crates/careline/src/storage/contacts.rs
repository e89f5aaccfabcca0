use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{from_micros, json_col, micros, not_found, uuid_col, Store};
use crate::error::{Error, Result};
use crate::types::{AuthoritativeContact, ContactInput};

const CONTACT_COLUMNS: &str =
    "id, organisation, phone, email, address, tags, notes, created_at, updated_at";

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<AuthoritativeContact> {
    Ok(AuthoritativeContact {
        id: uuid_col(row, 0)?,
        organisation: row.get(1)?,
        phone: row.get(2)?,
        email: row.get(3)?,
        address: row.get(4)?,
        tags: json_col(row, 5)?,
        notes: row.get(6)?,
        created_at: from_micros(row.get(7)?),
        updated_at: from_micros(row.get(8)?),
    })
}

fn map_unique_violation(err: rusqlite::Error, organisation: &str) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::Validation(format!("organisation '{}' already exists", organisation))
        }
        _ => Error::Storage(err),
    }
}

impl Store {
    pub async fn insert_contact(&self, input: ContactInput) -> Result<AuthoritativeContact> {
        self.call(move |conn| {
            let now = Utc::now();
            let contact = AuthoritativeContact {
                id: Uuid::new_v4(),
                organisation: input.organisation,
                phone: input.phone,
                email: input.email,
                address: input.address,
                tags: input.tags,
                notes: input.notes,
                created_at: now,
                updated_at: now,
            };
            let tags = contact.tags.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                &format!(
                    "INSERT INTO authoritative_contacts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    CONTACT_COLUMNS
                ),
                params![
                    contact.id.to_string(),
                    contact.organisation,
                    contact.phone,
                    contact.email,
                    contact.address,
                    tags,
                    contact.notes,
                    micros(&now),
                    micros(&now),
                ],
            )
            .map_err(|e| map_unique_violation(e, &contact.organisation))?;
            Ok(contact)
        })
        .await
    }

    /// Replace all mutable fields of a contact.
    pub async fn update_contact(&self, id: Uuid, input: ContactInput) -> Result<AuthoritativeContact> {
        self.call(move |conn| {
            let tags = input.tags.as_ref().map(serde_json::to_string).transpose()?;
            let n = conn
                .execute(
                    "UPDATE authoritative_contacts
                     SET organisation = ?2, phone = ?3, email = ?4, address = ?5, tags = ?6,
                         notes = ?7, updated_at = ?8
                     WHERE id = ?1",
                    params![
                        id.to_string(),
                        input.organisation,
                        input.phone,
                        input.email,
                        input.address,
                        tags,
                        input.notes,
                        micros(&Utc::now()),
                    ],
                )
                .map_err(|e| map_unique_violation(e, &input.organisation))?;
            if n == 0 {
                return Err(not_found("contact", id));
            }
            Ok(conn.query_row(
                &format!("SELECT {} FROM authoritative_contacts WHERE id = ?1", CONTACT_COLUMNS),
                params![id.to_string()],
                contact_from_row,
            )?)
        })
        .await
    }

    pub async fn delete_contact(&self, id: Uuid) -> Result<Option<AuthoritativeContact>> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let existing = tx
                .query_row(
                    &format!("SELECT {} FROM authoritative_contacts WHERE id = ?1", CONTACT_COLUMNS),
                    params![id.to_string()],
                    contact_from_row,
                )
                .optional()?;
            if existing.is_some() {
                tx.execute(
                    "DELETE FROM authoritative_contacts WHERE id = ?1",
                    params![id.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(existing)
        })
        .await
    }

    pub async fn get_contact(&self, id: Uuid) -> Result<Option<AuthoritativeContact>> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM authoritative_contacts WHERE id = ?1", CONTACT_COLUMNS),
                    params![id.to_string()],
                    contact_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn get_contact_by_organisation(
        &self,
        organisation: &str,
    ) -> Result<Option<AuthoritativeContact>> {
        let organisation = organisation.to_string();
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM authoritative_contacts WHERE organisation = ?1",
                        CONTACT_COLUMNS
                    ),
                    params![organisation],
                    contact_from_row,
                )
                .optional()?)
        })
        .await
    }

    pub async fn list_contacts(&self) -> Result<Vec<AuthoritativeContact>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM authoritative_contacts ORDER BY organisation ASC",
                CONTACT_COLUMNS
            ))?;
            let contacts = stmt
                .query_map([], contact_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(contacts)
        })
        .await
    }
}
