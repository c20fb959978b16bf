use farmstead_schemas::{EntityKind, Mention, RecordId};
use regex::Regex;
use std::collections::HashSet;
use tracing::debug;

/// Pulls entity mentions out of rich-text (HTML) fields.
///
/// A mention is any tag carrying both a `data-mention-type` attribute naming
/// an entity kind and a `data-mention-id` attribute holding a positive
/// integer, e.g. `<span data-mention-type="asset" data-mention-id="12">@Tractor</span>`.
/// Attribute order and quote style are free. Parsing is best-effort: tags
/// with an unknown kind or a bad id are skipped, never reported.
pub struct MentionExtractor {
    tag_pattern: Regex,
    type_pattern: Regex,
    id_pattern: Regex,
}

impl Default for MentionExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MentionExtractor {
    pub fn new() -> Self {
        Self {
            // Quoted attribute values may contain `>`
            tag_pattern: Regex::new(r#"<[A-Za-z](?:[^<>"']|"[^"]*"|'[^']*')*>"#)
                .expect("tag pattern"),
            type_pattern: Regex::new(r#"\bdata-mention-type\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
                .expect("mention type pattern"),
            id_pattern: Regex::new(r#"\bdata-mention-id\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
                .expect("mention id pattern"),
        }
    }

    /// Extract the deduplicated set of mentions in `html`.
    pub fn extract(&self, html: &str) -> HashSet<Mention> {
        let mut mentions = HashSet::new();
        if html.is_empty() {
            return mentions;
        }

        for tag in self.tag_pattern.find_iter(html) {
            let tag = tag.as_str();
            let Some(kind) = attribute(&self.type_pattern, tag) else {
                continue;
            };
            let Some(id) = attribute(&self.id_pattern, tag) else {
                debug!("Mention tag without id skipped: {}", tag);
                continue;
            };

            match (kind.trim().parse::<EntityKind>(), parse_id(id)) {
                (Ok(target_type), Some(target_id)) => {
                    mentions.insert(Mention::new(target_type, target_id));
                }
                _ => debug!("Malformed mention skipped: {}", tag),
            }
        }

        mentions
    }
}

fn attribute<'t>(pattern: &Regex, tag: &'t str) -> Option<&'t str> {
    let caps = pattern.captures(tag)?;
    caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str())
}

fn parse_id(raw: &str) -> Option<RecordId> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<RecordId>().ok().filter(|id| *id > 0)
}
