mod status;
mod wire;

pub use status::{BatchStatus, ConnectionState, FolderStatus, ResponseStatus, Validity};
pub use wire::WireConfig;

/// Cross-store document identifier: the work store keys encoded bodies by
/// this string so a body row can be traced back to its batch and document
/// without a cross-database foreign key.
pub fn work_document_id(batch_id: i32, document_id: i32) -> String {
    format!("batch_{batch_id}_doc_{document_id}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn work_document_id_convention() {
        assert_eq!(work_document_id(70, 1234), "batch_70_doc_1234");
    }
}
