//! Entities and their row encoding.

use crate::error::TxResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;

/// A value stored as one row of a table.
///
/// Keys and values cross the repository boundary as CBOR: the key is the
/// encoded `Id`, the value is the encoded entity.
pub trait Entity: Clone + Send + Serialize + DeserializeOwned + 'static {
    /// Identifier type. Its ordering defines the order of cache snapshots.
    type Id: Clone + Ord + Hash + Debug + Send + Serialize + DeserializeOwned + 'static;

    /// Name of the table holding this entity.
    const TABLE: &'static str;

    /// Returns the identifier of this entity.
    fn id(&self) -> Self::Id;
}

/// Encodes a value as CBOR.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> TxResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

/// Decodes a CBOR value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> TxResult<T> {
    Ok(ciborium::from_reader(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TxError;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Book {
        isbn: u64,
        title: String,
    }

    impl Entity for Book {
        type Id = u64;
        const TABLE: &'static str = "books";

        fn id(&self) -> u64 {
            self.isbn
        }
    }

    #[test]
    fn encodes_entity_and_key() {
        let book = Book {
            isbn: 9780131103627,
            title: "The C Programming Language".into(),
        };

        let bytes = encode(&book).unwrap();
        let decoded: Book = decode(&bytes).unwrap();
        assert_eq!(decoded, book);

        let key = encode(&book.id()).unwrap();
        assert_eq!(decode::<u64>(&key).unwrap(), book.isbn);
    }

    #[test]
    fn decode_garbage_is_codec_error() {
        let result = decode::<Book>(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(TxError::Codec { .. })));
    }
}
