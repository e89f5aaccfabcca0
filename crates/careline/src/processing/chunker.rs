use std::collections::HashMap;

use crate::config::ChunkingConfig;
use crate::types::NewDocument;

/// Look-back window, in characters, searched for a natural break.
const BREAK_WINDOW: usize = 200;

const SENTENCE_ENDS: &[char] = &['。', '！', '？', '!', '?', '.'];
const SOFT_BREAKS: &[char] = &['，', ' '];

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    pub index: usize,
    pub content: String,
    pub metadata: HashMap<String, String>,
}

/// Character-based splitter. Lengths count `char`s, so CJK text is cut at
/// roughly the same visual size as Latin text.
#[derive(Debug, Clone)]
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
}

impl TextChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize, min_chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
            min_chunk_size,
        }
    }

    pub fn from_config(config: &ChunkingConfig) -> Self {
        Self::new(config.chunk_size, config.chunk_overlap, config.min_chunk_size)
    }

    /// Split `title + content` and attach document metadata to every piece.
    pub fn chunk_document(&self, doc: &NewDocument) -> Vec<DocumentChunk> {
        let text = if doc.title.trim().is_empty() {
            doc.content.clone()
        } else {
            format!("{}\n\n{}", doc.title.trim(), doc.content)
        };

        let mut metadata = HashMap::new();
        metadata.insert("title".to_string(), doc.title.clone());
        metadata.insert("source".to_string(), doc.source.clone());
        metadata.insert("category".to_string(), doc.category.clone());
        metadata.insert("lang".to_string(), doc.lang.clone());
        if let Some(date) = doc.published_date {
            metadata.insert("published_date".to_string(), date.to_string());
        }

        self.chunk(&text)
            .into_iter()
            .enumerate()
            .map(|(index, content)| DocumentChunk {
                index,
                content,
                metadata: metadata.clone(),
            })
            .collect()
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.trim().chars().collect();
        let len = chars.len();
        if len == 0 {
            return Vec::new();
        }
        if len <= self.chunk_size {
            return if len >= self.min_chunk_size {
                vec![chars.iter().collect()]
            } else {
                Vec::new()
            };
        }

        let mut chunks = Vec::new();
        let mut start = 0;

        while start < len {
            let raw_end = (start + self.chunk_size).min(len);
            let end = if raw_end < len {
                self.find_break_point(&chars, start, raw_end)
            } else {
                raw_end
            };

            let piece: String = chars[start..end].iter().collect();
            let piece = piece.trim();
            if !piece.is_empty() && piece.chars().count() >= self.min_chunk_size {
                chunks.push(piece.to_string());
            }

            if end >= len {
                break;
            }

            // Move forward with overlap
            let taken = end - start;
            let step = if taken > self.chunk_overlap {
                taken - self.chunk_overlap
            } else {
                taken
            };
            start += step;
        }

        chunks
    }

    fn find_break_point(&self, chars: &[char], start: usize, preferred_end: usize) -> usize {
        // The break must leave a step larger than the overlap.
        let floor = (start + self.chunk_overlap + 1).max(start + self.chunk_size / 2);
        let search_start = preferred_end.saturating_sub(BREAK_WINDOW).max(floor);
        if search_start >= preferred_end {
            return preferred_end;
        }

        // Priority: paragraph break > sentence end > line break > comma or space
        let paragraph = rfind(chars, search_start, preferred_end, |i| {
            i > 0 && chars[i] == '\n' && chars[i - 1] == '\n'
        });
        if let Some(pos) = paragraph {
            return pos + 1;
        }
        if let Some(pos) = rfind(chars, search_start, preferred_end, |i| {
            SENTENCE_ENDS.contains(&chars[i])
        }) {
            return pos + 1;
        }
        if let Some(pos) = rfind(chars, search_start, preferred_end, |i| chars[i] == '\n') {
            return pos + 1;
        }
        if let Some(pos) = rfind(chars, search_start, preferred_end, |i| {
            SOFT_BREAKS.contains(&chars[i])
        }) {
            return pos + 1;
        }

        preferred_end
    }
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::from_config(&ChunkingConfig::default())
    }
}

/// Last index in `lo..hi` satisfying `pred`.
fn rfind(chars: &[char], lo: usize, hi: usize, pred: impl Fn(usize) -> bool) -> Option<usize> {
    (lo..hi.min(chars.len())).rev().find(|&i| pred(i))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(title: &str, content: &str) -> NewDocument {
        NewDocument {
            title: title.to_string(),
            content: content.to_string(),
            source: "manual".to_string(),
            category: "article".to_string(),
            lang: "zh-TW".to_string(),
            published_date: None,
        }
    }

    #[test]
    fn short_document_is_single_chunk_with_title() {
        let chunks = TextChunker::default().chunk_document(&doc("戒毒資源", "凱旋醫院提供戒癮門診。"));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].content, "戒毒資源\n\n凱旋醫院提供戒癮門診。");
        assert_eq!(chunks[0].metadata["title"], "戒毒資源");
        assert_eq!(chunks[0].metadata["source"], "manual");
        assert_eq!(chunks[0].metadata["lang"], "zh-TW");
        assert!(!chunks[0].metadata.contains_key("published_date"));
    }

    #[test]
    fn whitespace_only_yields_nothing() {
        assert!(TextChunker::default().chunk("  \n\t ").is_empty());
        assert!(TextChunker::default().chunk_document(&doc("", "   ")).is_empty());
    }

    #[test]
    fn cjk_text_is_measured_in_chars() {
        let sentence = "毒品危害防制局提供諮詢服務。";
        let text = sentence.repeat(100);
        let chunks = TextChunker::new(500, 50, 1).chunk(&text);
        assert!(chunks.len() >= 3);
        for c in &chunks {
            assert!(c.chars().count() <= 500, "chunk too long: {}", c.chars().count());
        }
        // Every chunk but the last ends on a sentence boundary.
        for c in &chunks[..chunks.len() - 1] {
            assert!(c.ends_with('。'));
        }
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text: String = (0..1200).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let chunks = TextChunker::new(500, 50, 1).chunk(&text);
        assert_eq!(chunks.len(), 3);
        let tail: String = chunks[0].chars().skip(450).collect();
        assert!(chunks[1].starts_with(&tail));
    }

    #[test]
    fn paragraph_break_preferred_over_sentence() {
        let first = "甲".repeat(380);
        let text = format!("{}。\n\n{}。乙乙。{}", first, "丙".repeat(60), "丁".repeat(300));
        let chunks = TextChunker::new(500, 50, 1).chunk(&text);
        assert!(chunks[0].ends_with(&format!("{}。", first)));
    }

    #[test]
    fn chunking_is_deterministic() {
        let d = doc("標題", &"一二三四五，六七八九十。".repeat(120));
        let chunker = TextChunker::default();
        let a = chunker.chunk_document(&d);
        let b = chunker.chunk_document(&d);
        assert_eq!(a, b);
        for (i, c) in a.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }
}
