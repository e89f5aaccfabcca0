//! Keeps one searchable knowledge document per authoritative contact.

use crate::error::Result;
use crate::types::{AuthoritativeContact, KnowledgeDocument, NewDocument};

use super::KnowledgeManager;

pub const CONTACT_SOURCE: &str = "authoritative_contacts";
pub const CONTACT_CATEGORY: &str = "contacts";

pub fn contact_title(organisation: &str) -> String {
    format!("機構聯絡資訊: {}", organisation.trim())
}

/// Text block indexed for a contact. Absent fields are left out.
pub fn contact_content(contact: &AuthoritativeContact) -> String {
    let mut lines = vec![contact.organisation.trim().to_string()];
    let mut push = |label: &str, value: Option<&str>| {
        if let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) {
            lines.push(format!("{}：{}", label, v));
        }
    };
    push("電話", contact.phone.as_deref());
    push("電子郵件", contact.email.as_deref());
    push("地址", contact.address.as_deref());
    let tags = contact
        .tags
        .as_ref()
        .map(|t| t.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect::<Vec<_>>().join("、"));
    push("服務類型", tags.as_deref());
    push("服務說明", contact.notes.as_deref());
    lines.join("\n")
}

#[derive(Clone)]
pub struct AuthoritySync {
    knowledge: KnowledgeManager,
}

impl AuthoritySync {
    pub fn new(knowledge: KnowledgeManager) -> Self {
        Self { knowledge }
    }

    /// Idempotent: an existing document for the organisation is returned
    /// unchanged.
    pub async fn sync_create(&self, contact: &AuthoritativeContact) -> Result<KnowledgeDocument> {
        let title = contact_title(&contact.organisation);
        if let Some(existing) = self.knowledge.store().find_document(CONTACT_SOURCE, &title).await? {
            return Ok(existing);
        }
        let doc = self.knowledge.add_document(contact_document(contact)).await?;
        tracing::info!(organisation = %contact.organisation, doc_id = %doc.id, "Contact synced to knowledge base");
        Ok(doc)
    }

    pub async fn sync_update(&self, contact: &AuthoritativeContact) -> Result<KnowledgeDocument> {
        let (doc, created) = self.knowledge.upsert_by_title(contact_document(contact)).await?;
        tracing::info!(organisation = %contact.organisation, doc_id = %doc.id, created, "Contact document refreshed");
        Ok(doc)
    }

    pub async fn sync_delete(&self, organisation: &str) -> Result<bool> {
        let deleted = self
            .knowledge
            .delete_by_title(CONTACT_SOURCE, &contact_title(organisation))
            .await?;
        if deleted {
            tracing::info!(organisation = %organisation, "Contact document removed");
        }
        Ok(deleted)
    }

    /// Create documents for contacts that have none. Returns how many were
    /// created.
    pub async fn repair_missing(&self) -> Result<usize> {
        let store = self.knowledge.store();
        let mut synced = 0;
        for contact in store.list_contacts().await? {
            let title = contact_title(&contact.organisation);
            if store.find_document(CONTACT_SOURCE, &title).await?.is_none() {
                self.sync_create(&contact).await?;
                synced += 1;
            }
        }
        tracing::info!(synced, "Contact repair finished");
        Ok(synced)
    }
}

fn contact_document(contact: &AuthoritativeContact) -> NewDocument {
    NewDocument {
        title: contact_title(&contact.organisation),
        content: contact_content(contact),
        source: CONTACT_SOURCE.to_string(),
        category: CONTACT_CATEGORY.to_string(),
        lang: crate::types::default_lang(),
        published_date: None,
    }
}
