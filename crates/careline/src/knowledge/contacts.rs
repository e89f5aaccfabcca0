//! Contact CRUD with write-through to the knowledge base.
//!
//! The contact row is the source of truth. A failed sync is logged and left
//! for [`AuthoritySync::repair_missing`] to pick up.

use uuid::Uuid;

use super::authority_sync::AuthoritySync;
use crate::error::{Error, Result};
use crate::storage::Store;
use crate::types::{AuthoritativeContact, ContactInput};

#[derive(Clone)]
pub struct ContactService {
    store: Store,
    sync: AuthoritySync,
}

impl ContactService {
    pub fn new(store: Store, sync: AuthoritySync) -> Self {
        Self { store, sync }
    }

    pub async fn create(&self, input: ContactInput) -> Result<AuthoritativeContact> {
        let input = normalise(input)?;
        let contact = self.store.insert_contact(input).await?;
        if let Err(e) = self.sync.sync_create(&contact).await {
            tracing::error!(organisation = %contact.organisation, error = %e, "Contact sync failed on create");
        }
        Ok(contact)
    }

    pub async fn update(&self, id: Uuid, input: ContactInput) -> Result<AuthoritativeContact> {
        let input = normalise(input)?;
        let previous = self
            .store
            .get_contact(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("contact {}", id)))?;
        let contact = self.store.update_contact(id, input).await?;

        if previous.organisation != contact.organisation {
            if let Err(e) = self.sync.sync_delete(&previous.organisation).await {
                tracing::error!(organisation = %previous.organisation, error = %e, "Stale contact document not removed");
            }
        }
        if let Err(e) = self.sync.sync_update(&contact).await {
            tracing::error!(organisation = %contact.organisation, error = %e, "Contact sync failed on update");
        }
        Ok(contact)
    }

    pub async fn delete(&self, id: Uuid) -> Result<AuthoritativeContact> {
        let contact = self
            .store
            .delete_contact(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("contact {}", id)))?;
        if let Err(e) = self.sync.sync_delete(&contact.organisation).await {
            tracing::error!(organisation = %contact.organisation, error = %e, "Contact sync failed on delete");
        }
        Ok(contact)
    }

    pub async fn get(&self, id: Uuid) -> Result<AuthoritativeContact> {
        self.store
            .get_contact(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("contact {}", id)))
    }

    pub async fn list(&self) -> Result<Vec<AuthoritativeContact>> {
        self.store.list_contacts().await
    }

    /// Update the contact with the same organisation, or create it.
    /// Returns the contact and whether it was created.
    pub async fn upsert_by_organisation(&self, input: ContactInput) -> Result<(AuthoritativeContact, bool)> {
        let input = normalise(input)?;
        match self.store.get_contact_by_organisation(&input.organisation).await? {
            Some(existing) => Ok((self.update(existing.id, merge(existing, input)).await?, false)),
            None => Ok((self.create(input).await?, true)),
        }
    }

    pub async fn repair(&self) -> Result<usize> {
        self.sync.repair_missing().await
    }
}

fn normalise(mut input: ContactInput) -> Result<ContactInput> {
    input.organisation = input.organisation.trim().to_string();
    if input.organisation.is_empty() {
        return Err(Error::Validation("organisation is required".into()));
    }
    Ok(input)
}

/// New values win; fields the new input leaves empty keep the stored value.
fn merge(existing: AuthoritativeContact, input: ContactInput) -> ContactInput {
    ContactInput {
        organisation: input.organisation,
        phone: input.phone.or(existing.phone),
        email: input.email.or(existing.email),
        address: input.address.or(existing.address),
        tags: input.tags.or(existing.tags),
        notes: input.notes.or(existing.notes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::knowledge::authority_sync::{contact_title, CONTACT_SOURCE};
    use crate::knowledge::KnowledgeManager;
    use crate::test_support::ConceptEmbedder;
    use std::sync::Arc;

    fn service() -> ContactService {
        let store = Store::open_in_memory().unwrap();
        let km = KnowledgeManager::new(store.clone(), Arc::new(ConceptEmbedder::new()), &AppConfig::default());
        ContactService::new(store, AuthoritySync::new(km))
    }

    fn input(org: &str, phone: Option<&str>) -> ContactInput {
        ContactInput {
            organisation: org.into(),
            phone: phone.map(String::from),
            ..ContactInput::default()
        }
    }

    async fn contact_doc(svc: &ContactService, org: &str) -> Option<crate::types::KnowledgeDocument> {
        svc.store.find_document(CONTACT_SOURCE, &contact_title(org)).await.unwrap()
    }

    #[tokio::test]
    async fn create_writes_through() {
        let svc = service();
        let contact = svc.create(input(" 毒防局 ", Some("07-713-4000"))).await.unwrap();
        assert_eq!(contact.organisation, "毒防局");
        let doc = contact_doc(&svc, "毒防局").await.unwrap();
        assert!(doc.content.contains("07-713-4000"));
    }

    #[tokio::test]
    async fn duplicate_organisation_is_rejected() {
        let svc = service();
        svc.create(input("毒防局", None)).await.unwrap();
        assert!(matches!(svc.create(input("毒防局", None)).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn rename_moves_the_document() {
        let svc = service();
        let contact = svc.create(input("舊名稱中心", Some("07-000-0000"))).await.unwrap();
        svc.update(contact.id, input("新名稱中心", Some("07-000-0000"))).await.unwrap();

        assert!(contact_doc(&svc, "舊名稱中心").await.is_none());
        assert!(contact_doc(&svc, "新名稱中心").await.is_some());
    }

    #[tokio::test]
    async fn delete_removes_row_and_document() {
        let svc = service();
        let contact = svc.create(input("晨曦會", None)).await.unwrap();
        svc.delete(contact.id).await.unwrap();

        assert!(contact_doc(&svc, "晨曦會").await.is_none());
        assert!(matches!(svc.get(contact.id).await, Err(Error::NotFound(_))));
        assert!(matches!(svc.delete(contact.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn upsert_merges_missing_fields() {
        let svc = service();
        let (first, created) = svc
            .upsert_by_organisation(ContactInput {
                organisation: "凱旋醫院".into(),
                phone: Some("07-751-3171".into()),
                address: Some("高雄市苓雅區凱旋二路130號".into()),
                ..ContactInput::default()
            })
            .await
            .unwrap();
        assert!(created);

        let (second, created) = svc
            .upsert_by_organisation(input("凱旋醫院", Some("07-751-3172")))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.phone.as_deref(), Some("07-751-3172"));
        assert_eq!(second.address.as_deref(), Some("高雄市苓雅區凱旋二路130號"));
        assert_eq!(svc.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blank_organisation_is_invalid() {
        let svc = service();
        assert!(matches!(svc.create(input("  ", None)).await, Err(Error::Validation(_))));
    }
}
