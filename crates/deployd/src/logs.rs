//! Live build log tailing.
//!
//! Each fetch is one progressive-read request. Callers drive pagination by
//! passing back `next_offset`; overlapping reads are not deduplicated.

use deploy_core::{BuildInstance, LogChunk};
use tracing::debug;

use crate::ci::{CiApi, Result};

/// Assemble a chunk from a progressive-read response.
///
/// `text_size` is the size indicator header, `more_data` the continuation flag.
/// Without a usable size header the next offset is `offset + text.len()`.
pub fn chunk_from_response(
    offset: u64,
    text: String,
    text_size: Option<&str>,
    more_data: Option<&str>,
) -> LogChunk {
    let next_offset = text_size
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or_else(|| offset.saturating_add(text.len() as u64));
    let has_more = more_data.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));

    LogChunk {
        text,
        next_offset,
        has_more,
    }
}

/// Fetch one slice of a build's log starting at `offset`.
pub async fn fetch_log_chunk(
    ci: &dyn CiApi,
    build: &BuildInstance,
    offset: u64,
) -> Result<LogChunk> {
    ci.ensure_configured()?;

    let chunk = ci.progressive_log(build, offset).await?;
    debug!(
        build = %build,
        offset,
        next_offset = chunk.next_offset,
        bytes = chunk.text.len(),
        has_more = chunk.has_more,
        "fetched log chunk"
    );
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ci::{CiError, UnconfiguredCi};
    use crate::fakes::ScriptedCi;

    #[test]
    fn size_header_sets_next_offset() {
        let chunk = chunk_from_response(0, "hello".to_string(), Some("5"), Some("false"));
        assert_eq!(
            chunk,
            LogChunk {
                text: "hello".to_string(),
                next_offset: 5,
                has_more: false,
            }
        );
    }

    #[test]
    fn missing_size_header_advances_by_text_length() {
        let chunk = chunk_from_response(10, "hello".to_string(), None, None);
        assert_eq!(chunk.next_offset, 15);
        assert!(!chunk.has_more);
    }

    #[test]
    fn unparsable_size_header_falls_back_to_length() {
        let chunk = chunk_from_response(3, "abc".to_string(), Some("lots"), Some("TRUE"));
        assert_eq!(chunk.next_offset, 6);
        assert!(chunk.has_more);
    }

    #[test]
    fn offset_near_max_saturates() {
        let chunk = chunk_from_response(u64::MAX, "x".to_string(), None, Some("false"));
        assert_eq!(chunk.next_offset, u64::MAX);
        assert!(!chunk.has_more);
    }

    #[test]
    fn empty_final_read_is_end_marker() {
        let chunk = chunk_from_response(120, String::new(), Some("120"), Some("false"));
        assert!(chunk.text.is_empty());
        assert_eq!(chunk.next_offset, 120);
        assert!(!chunk.has_more);
    }

    #[tokio::test]
    async fn fetch_is_one_upstream_request() {
        let ci = ScriptedCi::new().push_log(Ok(LogChunk {
            text: "step 1\n".to_string(),
            next_offset: 7,
            has_more: true,
        }));
        let build = BuildInstance::new("autodeploy", 3);

        let chunk = fetch_log_chunk(&ci, &build, 0).await.unwrap();

        assert_eq!(chunk.next_offset, 7);
        assert!(chunk.has_more);
        assert_eq!(ci.log_calls(), 1);
    }

    #[tokio::test]
    async fn fetch_without_credentials_is_configuration_error() {
        let ci = UnconfiguredCi::new("autodeploy", "missing setting: DEPLOYD_CI_URL");
        let build = BuildInstance::new("autodeploy", 3);

        let err = fetch_log_chunk(&ci, &build, 0).await.unwrap_err();

        assert!(matches!(err, CiError::Configuration(_)));
    }
}
