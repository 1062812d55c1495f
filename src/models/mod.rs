//! Domain model module declarations.

use serde::{Deserialize, Deserializer};

pub mod ops;
pub mod requests;

/// Identifier of a session, chosen by the connecting client.
pub type SessionId = String;

/// Identifier of a session consumer (one per transport connection).
pub type ConsumerId = String;

/// Identifier of a notebook cell.
pub type CellId = String;

/// Deserialize a field that the kernel sends either as a single value or
/// as a list of values.
///
/// Absent and `null` both map to `None`; a single object becomes a
/// one-element vector.
pub(crate) fn deserialize_one_or_many<'de, D, T>(
    deserializer: D,
) -> std::result::Result<Option<Vec<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }

    Ok(
        Option::<OneOrMany<T>>::deserialize(deserializer)?.map(|value| match value {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }),
    )
}
