//! Document encoding: file bytes to a padded base64 body row in the work
//! store.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to read {path}: {source}")]
    UnreadableFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] sqlx::Error),
}

/// Read, encode, and upsert one document body under the given work-store
/// key, returning the body id. Re-encoding the same key replaces the prior
/// body.
pub async fn encode_and_store(
    document_key: &str,
    filepath: &str,
    work: &sqlx::PgPool,
) -> Result<i64, EncodeError> {
    let bytes = tokio::fs::read(filepath)
        .await
        .map_err(|source| EncodeError::UnreadableFile {
            path: filepath.to_string(),
            source,
        })?;
    let file_size = bytes.len() as i64;
    let content = normalize_padding(&base64::encode(&bytes));

    let path = Path::new(filepath);
    let content_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();
    let doc_type = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "txt".to_string());

    let body_id = eval_sql::bodies::upsert(
        document_key,
        &content,
        &content_type,
        &doc_type,
        file_size,
        work,
    )
    .await?;

    tracing::debug!(document_key, body_id, file_size, "encoded document body");
    Ok(body_id)
}

/// Strip stray whitespace and right-pad with `=` to a multiple of four.
///
/// Downstream decoders reject unpadded content, and a historical incident
/// involved an off-by-one payload produced by a stray trailing byte; padding
/// normalization is required, not cosmetic.
pub fn normalize_padding(encoded: &str) -> String {
    let mut content = encoded.trim().to_string();
    let remainder = content.len() % 4;
    if remainder != 0 {
        content.extend(std::iter::repeat('=').take(4 - remainder));
    }
    content
}

/// Decode a stored body back to bytes. Used at dispatch time to validate the
/// stored content, and by tests to prove the round-trip.
pub fn decode_body(content: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::decode(content.trim())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn padding_is_normalized_to_multiple_of_four() {
        for raw in ["QQ", "QUI", "QUJD", "QUJDRA", "  QUJD\n"] {
            let normalized = normalize_padding(raw);
            assert_eq!(normalized.len() % 4, 0, "input {raw:?}");
        }
        assert_eq!(normalize_padding("QQ"), "QQ==");
        assert_eq!(normalize_padding("QUJD"), "QUJD");
    }

    #[test]
    fn encode_decode_round_trip() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let content = normalize_padding(&base64::encode(&bytes));
        assert_eq!(decode_body(&content).unwrap(), bytes);
    }

    #[test]
    fn normalized_content_always_decodes() {
        // "A" alone is not valid base64 even padded; the encoder never
        // produces it, but single-pad and double-pad forms must decode.
        assert_eq!(decode_body(&normalize_padding("QQ")).unwrap(), b"A");
        assert_eq!(decode_body(&normalize_padding("QUI")).unwrap(), b"AB");
    }
}
