//! Response validation and classification.
//!
//! Pure functions that turn a decoded generate-content response into either the
//! payload the caller asked for or a typed [`ResponseAnomaly`]. They are total: any
//! input, including truncated or adversarial payloads, yields a defined outcome.

use crate::Error;
use base64::Engine;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::OnceLock;

/// Longest payload excerpt kept in a [`ResponseAnomaly::Malformed`].
pub const MAX_SNIPPET_LEN: usize = 2048;

/// Finish reasons that mean the candidate was withheld by a filter.
const FILTER_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "IMAGE_SAFETY",
];

/// A generate-content response.
///
/// Every field is optional so that decoding a partial payload never fails; shape
/// problems are reported by the extract functions instead.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    /// Candidate completions.
    #[serde(default)]
    pub candidates: Option<Vec<Candidate>>,
    /// Feedback about the prompt, including block reasons.
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
}

/// One candidate completion.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// The generated content.
    #[serde(default)]
    pub content: Option<Content>,
    /// Why generation stopped, e.g. `STOP` or `SAFETY`.
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// Generated content: a role and its parts.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    /// The producer of the content, usually `model`.
    #[serde(default)]
    pub role: Option<String>,
    /// The content parts.
    #[serde(default)]
    pub parts: Option<Vec<Part>>,
}

/// One content part: text or inline binary data.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Text content.
    #[serde(default)]
    pub text: Option<String>,
    /// Inline binary content.
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

/// Base64-encoded binary content with its MIME type.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    /// The declared MIME type, e.g. `image/png`.
    #[serde(default)]
    pub mime_type: String,
    /// The base64 payload.
    #[serde(default)]
    pub data: String,
}

/// Feedback about the prompt.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    /// Set when the prompt itself was blocked.
    #[serde(default)]
    pub block_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Decodes a response from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`ResponseAnomaly::Malformed`] if the value is not an object of the
    /// expected shape.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ResponseAnomaly> {
        Self::deserialize(value).map_err(|e| ResponseAnomaly::Malformed {
            detail: format!("unexpected response shape: {e}"),
            snippet: Some(snippet(&value.to_string())),
        })
    }

    fn parts(&self) -> impl Iterator<Item = &Part> {
        self.candidates
            .iter()
            .flatten()
            .filter_map(|c| c.content.as_ref()?.parts.as_ref())
            .flatten()
    }

    fn filter_reason(&self) -> Option<String> {
        if let Some(reason) = self
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_ref())
            .filter(|r| !r.is_empty() && r.as_str() != "BLOCK_REASON_UNSPECIFIED")
        {
            return Some(reason.clone());
        }

        self.candidates
            .iter()
            .flatten()
            .filter_map(|c| c.finish_reason.as_deref())
            .find(|reason| FILTER_FINISH_REASONS.contains(reason))
            .map(str::to_string)
    }
}

/// A response that did not carry a usable payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponseAnomaly {
    /// Parts were present but all blank.
    #[error("response was empty")]
    Empty,
    /// The prompt or candidate was blocked by a filter.
    #[error("response filtered: {reason}")]
    Filtered {
        /// The block or finish reason.
        reason: String,
    },
    /// The response did not have the expected shape.
    #[error("malformed response: {detail}")]
    Malformed {
        /// What was wrong.
        detail: String,
        /// The offending text, truncated to [`MAX_SNIPPET_LEN`].
        snippet: Option<String>,
    },
}

impl From<ResponseAnomaly> for Error {
    fn from(anomaly: ResponseAnomaly) -> Self {
        match anomaly {
            ResponseAnomaly::Empty => Error::EmptyResponse,
            ResponseAnomaly::Filtered { reason } => Error::ContentFiltered { reason },
            ResponseAnomaly::Malformed { detail, snippet } => {
                Error::MalformedResponse { detail, snippet }
            }
        }
    }
}

/// The result of validating one raw response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome<T> {
    /// A usable payload.
    Success(T),
    /// Parts were present but all blank.
    Empty,
    /// The response was blocked by a filter.
    Filtered(String),
    /// The response did not have the expected shape.
    Malformed(String),
}

impl<T> ResponseOutcome<T> {
    /// Converts an extract result into an outcome.
    pub fn from_result(result: Result<T, ResponseAnomaly>) -> Self {
        match result {
            Ok(value) => ResponseOutcome::Success(value),
            Err(ResponseAnomaly::Empty) => ResponseOutcome::Empty,
            Err(ResponseAnomaly::Filtered { reason }) => ResponseOutcome::Filtered(reason),
            Err(ResponseAnomaly::Malformed { detail, .. }) => ResponseOutcome::Malformed(detail),
        }
    }

    /// Returns `true` for [`ResponseOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseOutcome::Success(_))
    }
}

/// Extracts the first non-blank text part, trimmed.
///
/// # Errors
///
/// - [`ResponseAnomaly::Filtered`] if the prompt was blocked or a candidate finished
///   for a safety reason. This is checked first, since a blocked response usually has
///   no candidates at all.
/// - [`ResponseAnomaly::Malformed`] if there are no candidates, content or parts.
/// - [`ResponseAnomaly::Empty`] if parts exist but no text part has content.
///
/// # Examples
///
/// ```
/// use callward::validate::{extract_text, GenerateContentResponse, ResponseAnomaly};
/// use serde_json::json;
///
/// let value = json!({"candidates": [{"content": {"parts": [{"text": "  A cat.  "}]}}]});
/// let response = GenerateContentResponse::from_value(&value).unwrap();
/// assert_eq!(extract_text(&response).unwrap(), "A cat.");
///
/// let value = json!({"candidates": [{"content": {"role": "model"}}]});
/// let response = GenerateContentResponse::from_value(&value).unwrap();
/// assert!(matches!(extract_text(&response), Err(ResponseAnomaly::Malformed { .. })));
/// ```
pub fn extract_text(response: &GenerateContentResponse) -> Result<String, ResponseAnomaly> {
    if let Some(reason) = response.filter_reason() {
        return Err(ResponseAnomaly::Filtered { reason });
    }

    let mut parts = response.parts().peekable();
    if parts.peek().is_none() {
        return Err(missing_parts(response));
    }

    parts
        .filter_map(|p| p.text.as_deref())
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or(ResponseAnomaly::Empty)
}

/// Extracts and decodes the first inline image.
///
/// # Errors
///
/// - [`ResponseAnomaly::Filtered`] if the response was blocked.
/// - [`ResponseAnomaly::Malformed`] if no part carries inline data with an `image/`
///   MIME type, or if its payload is not valid base64.
pub fn extract_binary(response: &GenerateContentResponse) -> Result<Vec<u8>, ResponseAnomaly> {
    if let Some(reason) = response.filter_reason() {
        return Err(ResponseAnomaly::Filtered { reason });
    }

    let inline = response
        .parts()
        .filter_map(|p| p.inline_data.as_ref())
        .find(|d| d.mime_type.to_ascii_lowercase().starts_with("image/"))
        .ok_or_else(|| ResponseAnomaly::Malformed {
            detail: "no inline image data in response".to_string(),
            snippet: None,
        })?;

    let encoded = inline.data.trim();
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(encoded))
        .map_err(|e| ResponseAnomaly::Malformed {
            detail: format!("inline {} data is not valid base64: {e}", inline.mime_type),
            snippet: Some(snippet(encoded)),
        })
}

fn fence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?ms)^[ \t]*```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)^[ \t]*```[ \t]*$")
            .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
    })
}

/// Removes a markdown code fence around the text, if there is one.
///
/// A fence only counts as a wrapper when its markers sit on their own lines, or when
/// the whole text is a single fenced line. Backticks inside the payload are kept.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(inner) = fence_pattern().captures(trimmed).and_then(|c| c.get(1)) {
        return inner.as_str().trim();
    }

    match trimmed
        .strip_prefix("```")
        .and_then(|rest| rest.strip_suffix("```"))
    {
        Some(inner) if !inner.contains("```") => inner
            .trim_start_matches(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            .trim(),
        _ => trimmed,
    }
}

/// Finds the largest JSON array or object embedded in `text`.
///
/// Every `[` or `{` is tried as a start; trailing prose after a value is ignored.
fn embedded_json(text: &str) -> Option<serde_json::Value> {
    let mut best: Option<(usize, serde_json::Value)> = None;
    let mut pos = 0;

    while let Some(offset) = text[pos..].find(|c: char| c == '[' || c == '{') {
        let start = pos + offset;
        let mut stream =
            serde_json::Deserializer::from_str(&text[start..]).into_iter::<serde_json::Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let len = stream.byte_offset();
                if best.as_ref().map_or(true, |(longest, _)| len > *longest) {
                    best = Some((len, value));
                }
                pos = start + len;
            }
            _ => pos = start + 1,
        }
    }

    best.map(|(_, value)| value)
}

/// Parses JSON embedded in model text.
///
/// The text is tried as-is first, then with a wrapping code fence stripped. Failing
/// both, the largest array or object found in the text is used.
///
/// # Errors
///
/// - [`ResponseAnomaly::Empty`] if the text is blank.
/// - [`ResponseAnomaly::Malformed`] if no JSON could be recovered; the offending text
///   is kept in `snippet`.
///
/// # Examples
///
/// ```
/// use callward::validate::extract_structured;
///
/// let raw = "Here you go:\n```json\n[{\"label\": \"cat\", \"box_2d\": [1, 2, 3, 4]}]\n```";
/// let value = extract_structured(raw).unwrap();
/// assert_eq!(value[0]["label"], "cat");
/// ```
pub fn extract_structured(raw: &str) -> Result<serde_json::Value, ResponseAnomaly> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ResponseAnomaly::Empty);
    }

    let first_error = match serde_json::from_str(trimmed) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };

    let body = strip_code_fence(raw);
    if body != trimmed {
        if let Ok(value) = serde_json::from_str(body) {
            return Ok(value);
        }
    }

    if let Some(value) = embedded_json(body).or_else(|| embedded_json(trimmed)) {
        tracing::debug!("Recovered JSON from surrounding text");
        return Ok(value);
    }

    tracing::error!(error = %first_error, raw_response = %raw, "Failed to parse structured response");
    Err(ResponseAnomaly::Malformed {
        detail: format!("embedded JSON did not parse: {first_error}"),
        snippet: Some(snippet(raw)),
    })
}

/// Like [`extract_structured`], decoding into `T`.
///
/// # Errors
///
/// As for [`extract_structured`], plus [`ResponseAnomaly::Malformed`] if the JSON does
/// not match `T`.
pub fn extract_structured_as<T: DeserializeOwned>(raw: &str) -> Result<T, ResponseAnomaly> {
    let value = extract_structured(raw)?;
    serde_json::from_value(value).map_err(|e| ResponseAnomaly::Malformed {
        detail: format!("embedded JSON has the wrong shape: {e}"),
        snippet: Some(snippet(raw)),
    })
}

fn missing_parts(response: &GenerateContentResponse) -> ResponseAnomaly {
    let detail = match response.candidates.as_deref() {
        None | Some([]) => "response has no candidates",
        Some(candidates) if candidates.iter().all(|c| c.content.is_none()) => {
            "candidates have no content"
        }
        Some(_) => "content has no parts",
    };
    ResponseAnomaly::Malformed {
        detail: detail.to_string(),
        snippet: None,
    }
}

fn snippet(raw: &str) -> String {
    if raw.len() <= MAX_SNIPPET_LEN {
        return raw.to_string();
    }
    let mut end = MAX_SNIPPET_LEN;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &raw[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response(value: serde_json::Value) -> GenerateContentResponse {
        GenerateContentResponse::from_value(&value).unwrap()
    }

    #[test]
    fn test_extract_text_first_non_blank_part() {
        let r = response(json!({
            "candidates": [{"content": {"role": "model", "parts": [
                {"text": "   "},
                {"inlineData": {"mimeType": "image/png", "data": "AAAA"}},
                {"text": "\n A red bicycle. \n"}
            ]}}]
        }));
        assert_eq!(extract_text(&r).unwrap(), "A red bicycle.");
    }

    #[test]
    fn test_role_only_content_is_malformed() {
        let r = response(json!({"candidates": [{"content": {"role": "model"}}]}));
        assert_eq!(
            extract_text(&r),
            Err(ResponseAnomaly::Malformed {
                detail: "content has no parts".to_string(),
                snippet: None
            })
        );
    }

    #[test]
    fn test_missing_candidates_and_content_are_malformed() {
        assert!(matches!(
            extract_text(&response(json!({}))),
            Err(ResponseAnomaly::Malformed { .. })
        ));
        assert!(matches!(
            extract_text(&response(json!({"candidates": [{"finishReason": "STOP"}]}))),
            Err(ResponseAnomaly::Malformed { .. })
        ));
    }

    #[test]
    fn test_blank_parts_are_empty() {
        let r = response(json!({"candidates": [{"content": {"parts": [{"text": " \t"}, {}]}}]}));
        assert_eq!(extract_text(&r), Err(ResponseAnomaly::Empty));
    }

    #[test]
    fn test_filter_markers_win() {
        let blocked = response(json!({"promptFeedback": {"blockReason": "SAFETY"}}));
        assert_eq!(
            extract_text(&blocked),
            Err(ResponseAnomaly::Filtered {
                reason: "SAFETY".to_string()
            })
        );

        let finished = response(json!({
            "candidates": [{"finishReason": "PROHIBITED_CONTENT", "content": {"parts": [{"text": "partial"}]}}]
        }));
        assert!(matches!(
            extract_text(&finished),
            Err(ResponseAnomaly::Filtered { .. })
        ));
    }

    #[test]
    fn test_non_object_payloads_are_malformed() {
        for value in [json!(null), json!("text"), json!([1, 2]), json!({"candidates": "nope"})] {
            assert!(matches!(
                GenerateContentResponse::from_value(&value),
                Err(ResponseAnomaly::Malformed { .. })
            ));
        }
    }

    #[test]
    fn test_extract_binary() {
        let r = response(json!({
            "candidates": [{"content": {"parts": [
                {"text": "here is your image"},
                {"inlineData": {"mimeType": "image/png", "data": "iVBORw0KGgo="}}
            ]}}]
        }));
        assert_eq!(
            extract_binary(&r).unwrap(),
            vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]
        );
    }

    #[test]
    fn test_extract_binary_requires_image_mime() {
        let r = response(json!({
            "candidates": [{"content": {"parts": [
                {"inlineData": {"mimeType": "application/pdf", "data": "AAAA"}}
            ]}}]
        }));
        assert!(matches!(
            extract_binary(&r),
            Err(ResponseAnomaly::Malformed { .. })
        ));

        let bad = response(json!({
            "candidates": [{"content": {"parts": [
                {"inlineData": {"mimeType": "image/jpeg", "data": "!!not base64!!"}}
            ]}}]
        }));
        match extract_binary(&bad) {
            Err(ResponseAnomaly::Malformed { snippet, .. }) => {
                assert_eq!(snippet.as_deref(), Some("!!not base64!!"))
            }
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_extract_structured_plain_and_fenced() {
        assert_eq!(extract_structured("{\"a\": 1}").unwrap(), json!({"a": 1}));
        assert_eq!(
            extract_structured("```\n[1, 2]\n```").unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            extract_structured("```json\n{\"masks\": []}\n```\nDone.").unwrap(),
            json!({"masks": []})
        );
    }

    #[test]
    fn test_extract_structured_fallback_to_outermost() {
        let raw = "Sure! The segmentation is [{\"label\": \"dog\"}] as requested.";
        assert_eq!(
            extract_structured(raw).unwrap(),
            json!([{"label": "dog"}])
        );
    }

    #[test]
    fn test_backticks_inside_json_strings_are_not_a_fence() {
        let raw = r#"{"note": "run ```ls``` first", "masks": [1]}"#;
        assert_eq!(
            extract_structured(raw).unwrap(),
            json!({"note": "run ```ls``` first", "masks": [1]})
        );
        assert_eq!(strip_code_fence(raw), raw);

        let fenced = "```json\n{\"hint\": \"wrap code in ```\"}\n```";
        assert_eq!(
            extract_structured(fenced).unwrap(),
            json!({"hint": "wrap code in ```"})
        );
        assert_eq!(strip_code_fence("```json [1, 2]```"), "[1, 2]");
    }

    #[test]
    fn test_brackets_in_leading_prose_are_skipped() {
        let raw = "Found [2] objects: [{\"label\": \"cat\"}, {\"label\": \"dog\"}] in the room.";
        assert_eq!(
            extract_structured(raw).unwrap(),
            json!([{"label": "cat"}, {"label": "dog"}])
        );
    }

    #[test]
    fn test_extract_binary_filter_wins_without_candidates() {
        let blocked = response(json!({"promptFeedback": {"blockReason": "PROHIBITED_CONTENT"}}));
        assert_eq!(
            extract_binary(&blocked),
            Err(ResponseAnomaly::Filtered {
                reason: "PROHIBITED_CONTENT".to_string()
            })
        );
    }

    #[test]
    fn test_extract_structured_keeps_snippet_on_failure() {
        let raw = "[{\"label\": \"dog\", \"box_2d\": [1, 2";
        match extract_structured(raw) {
            Err(ResponseAnomaly::Malformed { snippet, .. }) => {
                assert_eq!(snippet.as_deref(), Some(raw))
            }
            other => panic!("Expected Malformed, got {:?}", other),
        }
        assert_eq!(extract_structured("  \n"), Err(ResponseAnomaly::Empty));
    }

    #[test]
    fn test_extract_structured_as_typed() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Mask {
            label: String,
        }
        let masks: Vec<Mask> = extract_structured_as("[{\"label\": \"cat\"}]").unwrap();
        assert_eq!(masks, vec![Mask { label: "cat".into() }]);
        assert!(extract_structured_as::<Vec<Mask>>("{\"label\": 3}").is_err());
    }

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let long = "é".repeat(MAX_SNIPPET_LEN);
        let cut = snippet(&long);
        assert!(cut.ends_with('…'));
        assert!(cut.len() <= MAX_SNIPPET_LEN + '…'.len_utf8());
    }

    #[test]
    fn test_outcome_from_result() {
        assert!(ResponseOutcome::from_result(Ok::<_, ResponseAnomaly>(1)).is_success());
        assert_eq!(
            ResponseOutcome::<()>::from_result(Err(ResponseAnomaly::Filtered {
                reason: "SAFETY".into()
            })),
            ResponseOutcome::Filtered("SAFETY".into())
        );
        let err: Error = ResponseAnomaly::Empty.into();
        assert!(matches!(err, Error::EmptyResponse));
    }
}
