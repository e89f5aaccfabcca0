//! Drug information ingestion from spreadsheets and JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::KnowledgeManager;
use crate::error::{Error, Result};
use crate::processing::parser::read_workbook;
use crate::types::{DocumentFilter, KnowledgeDocument, NewDocument, Paging};

pub const DRUG_SOURCE: &str = "drug_database";
pub const DRUG_CATEGORY: &str = "drug_info";

/// Accepted header spellings per field, compared case-insensitively.
const COLUMNS: &[(&str, &[&str])] = &[
    ("name", &["名稱", "毒品名稱", "name"]),
    ("aliases", &["別名", "俗名", "aliases", "alias"]),
    ("schedule", &["級別", "分級", "schedule"]),
    ("effects", &["作用", "效果", "effects"]),
    ("risks", &["危害", "風險", "risks"]),
    ("treatment", &["治療", "treatment"]),
    ("legal", &["法律", "法律責任", "legal"]),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrugInfo {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub effects: String,
    #[serde(default)]
    pub risks: String,
    #[serde(default)]
    pub treatment: String,
    #[serde(default)]
    pub legal: String,
}

impl DrugInfo {
    pub fn title(&self) -> String {
        format!("毒品資訊: {}", self.name.trim())
    }

    pub fn content(&self) -> String {
        let mut lines = vec![format!("名稱：{}", self.name.trim())];
        if !self.aliases.is_empty() {
            lines.push(format!("別名：{}", self.aliases.join("、")));
        }
        for (label, value) in [
            ("級別", &self.schedule),
            ("作用", &self.effects),
            ("危害", &self.risks),
            ("治療", &self.treatment),
            ("法律責任", &self.legal),
        ] {
            if !value.trim().is_empty() {
                lines.push(format!("{}：{}", label, value.trim()));
            }
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DrugTemplate {
    pub columns: Vec<&'static str>,
    pub example: DrugInfo,
}

#[derive(Clone)]
pub struct DrugService {
    knowledge: KnowledgeManager,
}

impl DrugService {
    pub fn new(knowledge: KnowledgeManager) -> Self {
        Self { knowledge }
    }

    /// First worksheet, one drug per row under a header row.
    pub async fn upload_excel(&self, bytes: &[u8]) -> Result<ImportReport> {
        let sheets = read_workbook(bytes)?;
        let (_, rows) = sheets
            .into_iter()
            .next()
            .ok_or_else(|| Error::Validation("workbook has no sheets".into()))?;
        let (records, skipped) = records_from_rows(&rows)?;
        let mut report = self.import(records).await;
        report.skipped += skipped;
        Ok(report)
    }

    /// A JSON array of records, or an object holding one under `drugs`.
    pub async fn upload_json(&self, bytes: &[u8]) -> Result<ImportReport> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::Validation(format!("invalid JSON: {}", e)))?;
        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("drugs") {
                Some(Value::Array(items)) => items,
                _ => return Err(Error::Validation("expected an array of drug records".into())),
            },
            _ => return Err(Error::Validation("expected an array of drug records".into())),
        };

        let mut records = Vec::new();
        let mut report = ImportReport::default();
        for (i, item) in items.into_iter().enumerate() {
            match serde_json::from_value::<DrugInfo>(item) {
                Ok(info) if !info.name.trim().is_empty() => records.push(info),
                Ok(_) => report.skipped += 1,
                Err(e) => report.errors.push(format!("record {}: {}", i, e)),
            }
        }
        let imported = self.import(records).await;
        report.created = imported.created;
        report.updated = imported.updated;
        report.errors.extend(imported.errors);
        Ok(report)
    }

    pub fn template(&self) -> DrugTemplate {
        DrugTemplate {
            columns: COLUMNS.iter().map(|(_, names)| names[0]).collect(),
            example: DrugInfo {
                name: "愷他命".into(),
                aliases: vec!["K他命".into(), "K仔".into()],
                schedule: "第三級毒品".into(),
                effects: "解離感、幻覺".into(),
                risks: "膀胱損傷、認知功能下降".into(),
                treatment: "可至成癮門診接受評估與治療".into(),
                legal: "持有純質淨重二十公克以上者處三年以下有期徒刑".into(),
            },
        }
    }

    pub async fn list(&self, paging: Paging) -> Result<(Vec<KnowledgeDocument>, usize)> {
        self.knowledge
            .list_documents(DocumentFilter::source(DRUG_SOURCE), paging)
            .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        match self.knowledge.get_document(id).await? {
            Some(doc) if doc.source == DRUG_SOURCE => {
                self.knowledge.delete_document(id).await?;
                Ok(())
            }
            _ => Err(Error::NotFound(format!("drug document {}", id))),
        }
    }

    async fn import(&self, records: Vec<DrugInfo>) -> ImportReport {
        let mut report = ImportReport::default();
        for info in records {
            let new = NewDocument {
                title: info.title(),
                content: info.content(),
                source: DRUG_SOURCE.to_string(),
                category: DRUG_CATEGORY.to_string(),
                lang: crate::types::default_lang(),
                published_date: None,
            };
            match self.knowledge.upsert_by_title(new).await {
                Ok((_, true)) => report.created += 1,
                Ok((_, false)) => report.updated += 1,
                Err(e) => {
                    tracing::warn!(drug = %info.name, error = %e, "Drug record not imported");
                    report.errors.push(format!("{}: {}", info.name, e));
                }
            }
        }
        tracing::info!(
            created = report.created,
            updated = report.updated,
            errors = report.errors.len(),
            "Drug import finished"
        );
        report
    }
}

/// Map a header row onto [`DrugInfo`] fields. Returns the records and the
/// number of rows skipped for lacking a name.
pub fn records_from_rows(rows: &[Vec<String>]) -> Result<(Vec<DrugInfo>, usize)> {
    let header = rows
        .first()
        .ok_or_else(|| Error::Validation("sheet is empty".into()))?;
    let column_of = |field: &str| -> Option<usize> {
        let names = COLUMNS.iter().find(|(f, _)| *f == field)?.1;
        header.iter().position(|h| {
            let h = h.trim().to_lowercase();
            names.iter().any(|n| h == n.to_lowercase())
        })
    };
    let name_col = column_of("name")
        .ok_or_else(|| Error::Validation("missing name column (名稱/name)".into()))?;
    let cell = |row: &Vec<String>, field: &str| -> String {
        column_of(field)
            .and_then(|i| row.get(i))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    let mut records = Vec::new();
    let mut skipped = 0;
    for row in &rows[1..] {
        let name = row.get(name_col).map(|s| s.trim()).unwrap_or("");
        if name.is_empty() {
            if row.iter().any(|c| !c.trim().is_empty()) {
                skipped += 1;
            }
            continue;
        }
        records.push(DrugInfo {
            name: name.to_string(),
            aliases: split_aliases(&cell(row, "aliases")),
            schedule: cell(row, "schedule"),
            effects: cell(row, "effects"),
            risks: cell(row, "risks"),
            treatment: cell(row, "treatment"),
            legal: cell(row, "legal"),
        });
    }
    Ok((records, skipped))
}

fn split_aliases(raw: &str) -> Vec<String> {
    raw.split(|c| matches!(c, ',' | '，' | '、' | ';' | '；' | '/'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::storage::Store;
    use crate::test_support::ConceptEmbedder;
    use std::sync::Arc;

    fn service() -> DrugService {
        let store = Store::open_in_memory().unwrap();
        DrugService::new(KnowledgeManager::new(
            store,
            Arc::new(ConceptEmbedder::new()),
            &AppConfig::default(),
        ))
    }

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn headers_match_in_either_language() {
        let rows = vec![
            row(&["Name", "別名", "級別", "risks"]),
            row(&["安非他命", "冰塊、安公子", "第二級", "成癮"]),
            row(&["", "", "", ""]),
            row(&["", "孤兒列", "", ""]),
        ];
        let (records, skipped) = records_from_rows(&rows).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(skipped, 1);
        assert_eq!(records[0].aliases, vec!["冰塊", "安公子"]);
        assert_eq!(records[0].schedule, "第二級");
        assert_eq!(records[0].risks, "成癮");
        assert!(records[0].treatment.is_empty());
    }

    #[test]
    fn missing_name_column_is_invalid() {
        let rows = vec![row(&["級別"]), row(&["第一級"])];
        assert!(matches!(records_from_rows(&rows), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn json_upload_creates_then_updates_in_place() {
        let svc = service();
        let body = br#"[{"name":"海洛因","schedule":"第一級"},{"name":" "},{"schedule":1}]"#;
        let report = svc.upload_json(body).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.errors.len(), 1);

        let again = br#"{"drugs":[{"name":"海洛因","schedule":"第一級","treatment":"美沙冬替代療法"}]}"#;
        let report = svc.upload_json(again).await.unwrap();
        assert_eq!(report.updated, 1);

        let (docs, total) = svc.list(Paging::default()).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(docs[0].title, "毒品資訊: 海洛因");
        assert!(docs[0].content.contains("治療：美沙冬替代療法"));
        assert_eq!(docs[0].category, DRUG_CATEGORY);
    }

    #[tokio::test]
    async fn delete_only_touches_drug_documents() {
        let svc = service();
        svc.upload_json(br#"[{"name":"大麻"}]"#).await.unwrap();
        let (docs, _) = svc.list(Paging::default()).await.unwrap();

        svc.delete(docs[0].id).await.unwrap();
        assert!(matches!(svc.delete(docs[0].id).await, Err(Error::NotFound(_))));

        let other = svc
            .knowledge
            .add_document(NewDocument {
                title: "其他".into(),
                content: "內容".into(),
                source: "manual".into(),
                category: "general".into(),
                lang: "zh-TW".into(),
                published_date: None,
            })
            .await
            .unwrap();
        assert!(matches!(svc.delete(other.id).await, Err(Error::NotFound(_))));
    }

    #[test]
    fn template_lists_primary_headers() {
        let template = service().template();
        assert_eq!(template.columns[0], "名稱");
        assert_eq!(template.columns.len(), 7);
        assert!(!template.example.name.is_empty());
    }

    #[tokio::test]
    async fn malformed_json_is_invalid() {
        assert!(matches!(service().upload_json(b"not json").await, Err(Error::Validation(_))));
    }
}
