//! Exchange files for names the registry could not resolve.
//!
//! Unresolved names go out as one name per line; canonical names come back
//! either as `localized<TAB>canonical` lines or as a JSON object, possibly
//! wrapped in prose or a fenced code block.

use std::path::Path;

use log::{debug, info, warn};

use crate::error::{AssistError, StoreError};
use crate::name_store::NameStore;
use crate::protocol::{ResolutionRecord, ResolutionSource};

/// Localized names currently stored as `not_found`, sorted.
pub fn export_unresolved(store: &NameStore) -> Result<Vec<String>, StoreError> {
    Ok(store
        .unresolved()?
        .into_iter()
        .map(|record| record.localized_name)
        .collect())
}

/// Stores externally produced canonical names with `llm_assist` provenance.
///
/// Each mapping is classified like a registry match, so a mapping back to
/// the same name becomes `matched_identical`. Returns the number stored.
pub fn import_assisted_mappings(
    store: &NameStore,
    mappings: &[(String, String)],
) -> Result<usize, StoreError> {
    let mut imported = 0usize;
    for (localized, canonical) in mappings {
        let localized = localized.trim();
        let canonical = canonical.trim();
        if localized.is_empty() || canonical.is_empty() {
            continue;
        }
        let record =
            ResolutionRecord::matched(localized, canonical, ResolutionSource::LlmAssist, None);
        debug!(
            "Assist[{}]: importing canonical={} status={}",
            localized,
            canonical,
            record.status.as_str()
        );
        store.put(&record)?;
        imported += 1;
    }
    info!("Assist: imported {} of {} mapping(s)", imported, mappings.len());
    Ok(imported)
}

pub fn write_unresolved_file(path: &Path, names: &[String]) -> Result<(), AssistError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut content = names.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    std::fs::write(path, content)?;
    Ok(())
}

pub fn read_mappings_file(path: &Path) -> Result<Vec<(String, String)>, AssistError> {
    let content = std::fs::read_to_string(path)?;
    let mappings = parse_mappings(&content);
    if mappings.is_empty() {
        return Err(AssistError::NoMappings(path.display().to_string()));
    }
    Ok(mappings)
}

/// Parses TSV lines or an embedded JSON object of `localized -> canonical`.
pub fn parse_mappings(text: &str) -> Vec<(String, String)> {
    if let Some(mappings) = extract_json_mappings(text) {
        return mappings;
    }
    text.lines()
        .filter_map(|line| {
            let mut parts = line.trim().split('\t');
            let localized = parts.next()?.trim();
            let canonical = parts.next()?.trim();
            if localized.is_empty() || canonical.is_empty() {
                return None;
            }
            Some((localized.to_string(), canonical.to_string()))
        })
        .collect()
}

fn extract_json_mappings(text: &str) -> Option<Vec<(String, String)>> {
    let trimmed = text.trim();
    if let Some(mappings) = parse_json_object(trimmed) {
        return Some(mappings);
    }
    if let Some(block) = fenced_block(trimmed) {
        if let Some(mappings) = parse_json_object(block) {
            return Some(mappings);
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if start >= end {
        return None;
    }
    parse_json_object(&trimmed[start..=end])
}

/// Body of the first ``` fence, with an optional `json` language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let body_start = after_open.find('\n').map(|index| index + 1).unwrap_or(0);
    let language = after_open[..body_start].trim();
    if !language.is_empty() && !language.eq_ignore_ascii_case("json") {
        return None;
    }
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

fn parse_json_object(text: &str) -> Option<Vec<(String, String)>> {
    if !text.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let object = value.as_object()?;
    let mut mappings = Vec::with_capacity(object.len());
    for (localized, canonical) in object {
        match canonical.as_str() {
            Some(canonical) => mappings.push((localized.clone(), canonical.to_string())),
            None => warn!("Assist[{}]: ignoring non-string mapping value", localized),
        }
    }
    Some(mappings)
}

#[cfg(test)]
mod tests {
    use super::{
        export_unresolved, import_assisted_mappings, parse_mappings, read_mappings_file,
        write_unresolved_file,
    };
    use crate::error::AssistError;
    use crate::name_store::NameStore;
    use crate::protocol::{ResolutionRecord, ResolutionSource, ResolutionStatus};
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(name: &str) -> PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be valid")
            .as_nanos();
        std::env::temp_dir().join(format!("artist_deloc_{name}_{nonce}"))
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(left, right)| (left.to_string(), right.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_tsv_skips_blank_and_incomplete_lines() {
        let text = "ビートルズ\tThe Beatles\n\n壊れた行\n 木村カエラ \t 木村カエラ \n";
        assert_eq!(
            parse_mappings(text),
            pairs(&[("ビートルズ", "The Beatles"), ("木村カエラ", "木村カエラ")])
        );
    }

    #[test]
    fn test_parse_json_inside_fenced_block_with_prose() {
        let text = "Here you go:\n```json\n{\"ビートルズ\": \"The Beatles\", \"ビョーク\": \"Björk\"}\n```\nDone.";
        let mut mappings = parse_mappings(text);
        mappings.sort();
        assert_eq!(
            mappings,
            pairs(&[("ビョーク", "Björk"), ("ビートルズ", "The Beatles")])
        );
    }

    #[test]
    fn test_parse_json_embedded_in_prose_without_fence() {
        let text = "Result: {\"イエス\": \"Yes\"} hope this helps";
        assert_eq!(parse_mappings(text), pairs(&[("イエス", "Yes")]));
    }

    #[test]
    fn test_import_classifies_and_marks_assisted_source() {
        let store = NameStore::open_in_memory().expect("store should open");
        store
            .put(&ResolutionRecord::not_found("ビートルズ", false))
            .expect("put should succeed");
        store
            .put(&ResolutionRecord::not_found("木村カエラ", true))
            .expect("put should succeed");
        assert_eq!(
            export_unresolved(&store).expect("export should succeed"),
            vec!["ビートルズ".to_string(), "木村カエラ".to_string()]
        );

        let imported = import_assisted_mappings(
            &store,
            &pairs(&[
                ("ビートルズ", "The Beatles"),
                ("木村カエラ", "木村カエラ"),
                ("", "ignored"),
            ]),
        )
        .expect("import should succeed");
        assert_eq!(imported, 2);

        let beatles = store
            .get("ビートルズ")
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(beatles.status, ResolutionStatus::MatchedDifferent);
        assert_eq!(beatles.source, ResolutionSource::LlmAssist);
        assert_eq!(beatles.registry_id, None);

        let kaela = store
            .get("木村カエラ")
            .expect("get should succeed")
            .expect("record should exist");
        assert_eq!(kaela.status, ResolutionStatus::MatchedIdentical);
        assert!(!kaela.transient_failure);
        assert!(export_unresolved(&store)
            .expect("export should succeed")
            .is_empty());
    }

    #[test]
    fn test_unresolved_file_and_mappings_file_round_trip_through_disk() {
        let dir = unique_temp_dir("assist_files");
        let unresolved_path = dir.join("out/unresolved.tsv");
        write_unresolved_file(
            &unresolved_path,
            &["ビートルズ".to_string(), "ビョーク".to_string()],
        )
        .expect("export file should write");
        assert_eq!(
            fs::read_to_string(&unresolved_path).expect("export file should read"),
            "ビートルズ\nビョーク\n"
        );

        let mappings_path = dir.join("mappings.tsv");
        fs::write(&mappings_path, "\n\n").expect("fixture should write");
        assert!(matches!(
            read_mappings_file(&mappings_path),
            Err(AssistError::NoMappings(_))
        ));

        fs::write(&mappings_path, "ビョーク\tBjörk\n").expect("fixture should write");
        assert_eq!(
            read_mappings_file(&mappings_path).expect("mappings should read"),
            pairs(&[("ビョーク", "Björk")])
        );

        fs::remove_dir_all(dir).expect("temp dir should be removable");
    }
}
