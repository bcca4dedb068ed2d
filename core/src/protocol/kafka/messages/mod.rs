//! Request and response bodies, one module per API.
//!
//! Every type implements [`Encodable`](super::Encodable) and
//! [`Decodable`](super::Decodable) for each version listed on its request's
//! [`ApiRequest::VERSIONS`](super::ApiRequest::VERSIONS). Fields that do not
//! exist in a given version are skipped on encode and take their schema
//! default on decode.

mod add_partitions_to_txn;
mod end_txn;
mod find_coordinator;
mod header;
mod init_producer_id;
mod metadata;
mod produce;

pub use add_partitions_to_txn::*;
pub use end_txn::*;
pub use find_coordinator::*;
pub use header::*;
pub use init_producer_id::*;
pub use metadata::*;
pub use produce::*;

use bytes::BytesMut;
use std::io::Cursor;

use super::codec::{self, CodecError};
use super::tagged_fields::TaggedFields;

pub(crate) fn put_array<T, F>(
    buf: &mut BytesMut,
    items: &[T],
    flexible: bool,
    mut put: F,
) -> codec::Result<()>
where
    F: FnMut(&mut BytesMut, &T) -> codec::Result<()>,
{
    codec::put_array_len(buf, Some(items.len()), flexible)?;
    for item in items {
        put(buf, item)?;
    }
    Ok(())
}

pub(crate) fn get_nullable_array<T, F>(
    cursor: &mut Cursor<&[u8]>,
    flexible: bool,
    mut get: F,
) -> codec::Result<Option<Vec<T>>>
where
    F: FnMut(&mut Cursor<&[u8]>) -> codec::Result<T>,
{
    match codec::get_array_len(cursor, flexible)? {
        None => Ok(None),
        Some(len) => {
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(get(cursor)?);
            }
            Ok(Some(items))
        }
    }
}

pub(crate) fn get_array<T, F>(
    cursor: &mut Cursor<&[u8]>,
    flexible: bool,
    get: F,
) -> codec::Result<Vec<T>>
where
    F: FnMut(&mut Cursor<&[u8]>) -> codec::Result<T>,
{
    get_nullable_array(cursor, flexible, get)?
        .ok_or_else(|| CodecError::malformed("Expected non-null array"))
}

pub(crate) fn put_tagged(buf: &mut BytesMut, fields: &TaggedFields, flexible: bool) {
    if flexible {
        fields.encode(buf);
    }
}

pub(crate) fn get_tagged(cursor: &mut Cursor<&[u8]>, flexible: bool) -> codec::Result<TaggedFields> {
    if flexible {
        TaggedFields::decode(cursor)
    } else {
        Ok(TaggedFields::new())
    }
}
