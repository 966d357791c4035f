//! Polymorphic item payloads.
//!
//! The base CRDT's content interface is represented as a tagged sum so every
//! capability dispatch is exhaustive. `Ref` and `Unref` are the block-embedding
//! variants; they are never mergeable and `Unref` pins its item against GC.

use crate::codec::{CodecError, Reader, Writer};
use crate::types::TypeKind;
use serde_json::Value;

pub const TAG_GC: u8 = 0;
pub const TAG_DELETED: u8 = 1;
pub const TAG_JSON: u8 = 2;
pub const TAG_BINARY: u8 = 3;
pub const TAG_STRING: u8 = 4;
pub const TAG_EMBED: u8 = 5;
pub const TAG_FORMAT: u8 = 6;
pub const TAG_TYPE: u8 = 7;
pub const TAG_SKIP: u8 = 10;
pub const TAG_REF: u8 = 11;
pub const TAG_UNREF: u8 = 12;

/// Descriptor of a nested type embedded in an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    pub kind: TypeKind,
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// Content was deleted before it ever reached this peer; only the length
    /// survives.
    Deleted(u32),
    /// A run of JSON values, one countable element each.
    Json(Vec<Value>),
    Binary(Vec<u8>),
    /// A run of text, one countable element per char.
    String(String),
    /// A single embedded object (rich-text embeds).
    Embed(Value),
    /// A formatting boundary; not countable.
    Format { key: String, value: Value },
    /// A nested type anchored at this item.
    Type(TypeDef),
    /// A reference embedding another block as a child of this one.
    Ref {
        block_id: String,
        block_type: TypeKind,
    },
    /// A record that a previous `Ref` was forgotten. Pinned against GC so
    /// peers can prune stale back-references.
    Unref {
        block_id: String,
        client: u32,
        clock: u32,
    },
}

impl Content {
    pub fn len(&self) -> u32 {
        match self {
            Content::Deleted(len) => *len,
            Content::Json(values) => values.len() as u32,
            Content::String(s) => s.chars().count() as u32,
            Content::Binary(_)
            | Content::Embed(_)
            | Content::Format { .. }
            | Content::Type(_)
            | Content::Ref { .. }
            | Content::Unref { .. } => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Countable contents contribute to a sequence type's length.
    pub fn countable(&self) -> bool {
        !matches!(self, Content::Deleted(_) | Content::Format { .. })
    }

    /// Whether `splice` is supported (multi-element runs only).
    pub fn splittable(&self) -> bool {
        matches!(
            self,
            Content::Deleted(_) | Content::Json(_) | Content::String(_)
        )
    }

    /// Split off and return the tail starting at `offset` elements, keeping
    /// the head in place. Caller guarantees `0 < offset < len`.
    pub fn splice(&mut self, offset: u32) -> Content {
        match self {
            Content::Deleted(len) => {
                let right = *len - offset;
                *len = offset;
                Content::Deleted(right)
            }
            Content::Json(values) => Content::Json(values.split_off(offset as usize)),
            Content::String(s) => {
                let byte_offset = s
                    .char_indices()
                    .nth(offset as usize)
                    .map(|(i, _)| i)
                    .unwrap_or(s.len());
                Content::String(s.split_off(byte_offset))
            }
            _ => unreachable!("splice on unsplittable content"),
        }
    }

    /// Append `other` into `self` when the variants allow it. `Ref` and
    /// `Unref` always refuse.
    pub fn merge_with(&mut self, other: &Content) -> bool {
        match (self, other) {
            (Content::Deleted(len), Content::Deleted(other_len)) => {
                *len += other_len;
                true
            }
            (Content::Json(values), Content::Json(other_values)) => {
                values.extend(other_values.iter().cloned());
                true
            }
            (Content::String(s), Content::String(other_s)) => {
                s.push_str(other_s);
                true
            }
            _ => false,
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Content::Deleted(_) => TAG_DELETED,
            Content::Json(_) => TAG_JSON,
            Content::Binary(_) => TAG_BINARY,
            Content::String(_) => TAG_STRING,
            Content::Embed(_) => TAG_EMBED,
            Content::Format { .. } => TAG_FORMAT,
            Content::Type(_) => TAG_TYPE,
            Content::Ref { .. } => TAG_REF,
            Content::Unref { .. } => TAG_UNREF,
        }
    }

    pub fn write(&self, w: &mut Writer) {
        match self {
            Content::Deleted(len) => w.write_var_u32(*len),
            Content::Json(values) => {
                w.write_var_u32(values.len() as u32);
                for value in values {
                    w.write_any(value);
                }
            }
            Content::Binary(bytes) => w.write_buf(bytes),
            Content::String(s) => w.write_string(s),
            Content::Embed(value) => w.write_any(value),
            Content::Format { key, value } => {
                w.write_string(key);
                w.write_any(value);
            }
            Content::Type(def) => {
                w.write_u8(def.kind.tag());
                match &def.node_name {
                    Some(name) => {
                        w.write_u8(1);
                        w.write_string(name);
                    }
                    None => w.write_u8(0),
                }
            }
            Content::Ref {
                block_id,
                block_type,
            } => {
                w.write_string(block_id);
                w.write_string(block_type.as_str());
            }
            Content::Unref {
                block_id,
                client,
                clock,
            } => {
                w.write_any(&serde_json::json!({
                    "block_id": block_id,
                    "client": client,
                    "clock": clock,
                }));
            }
        }
    }

    pub fn read(tag: u8, r: &mut Reader<'_>) -> Result<Content, CodecError> {
        Ok(match tag {
            TAG_DELETED => Content::Deleted(r.read_var_u32()?),
            TAG_JSON => {
                let len = r.read_var_u32()? as usize;
                let mut values = Vec::with_capacity(len);
                for _ in 0..len {
                    values.push(r.read_any()?);
                }
                Content::Json(values)
            }
            TAG_BINARY => Content::Binary(r.read_buf()?.to_vec()),
            TAG_STRING => Content::String(r.read_string()?),
            TAG_EMBED => Content::Embed(r.read_any()?),
            TAG_FORMAT => Content::Format {
                key: r.read_string()?,
                value: r.read_any()?,
            },
            TAG_TYPE => {
                let kind = TypeKind::from_tag(r.read_u8()?).ok_or(CodecError::InvalidCbor)?;
                let node_name = if r.read_u8()? == 1 {
                    Some(r.read_string()?)
                } else {
                    None
                };
                Content::Type(TypeDef { kind, node_name })
            }
            TAG_REF => {
                let block_id = r.read_string()?;
                let type_name = r.read_string()?;
                let block_type =
                    TypeKind::from_str_name(&type_name).ok_or(CodecError::InvalidCbor)?;
                Content::Ref {
                    block_id,
                    block_type,
                }
            }
            TAG_UNREF => {
                let record = r.read_any()?;
                let block_id = record
                    .get("block_id")
                    .and_then(Value::as_str)
                    .ok_or(CodecError::InvalidCbor)?
                    .to_owned();
                let client = record
                    .get("client")
                    .and_then(Value::as_u64)
                    .ok_or(CodecError::InvalidCbor)? as u32;
                let clock = record
                    .get("clock")
                    .and_then(Value::as_u64)
                    .ok_or(CodecError::InvalidCbor)? as u32;
                Content::Unref {
                    block_id,
                    client,
                    clock,
                }
            }
            other => return Err(CodecError::UnknownTag(other)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_splice_respects_char_boundaries() {
        let mut content = Content::String("aé€b".into());
        assert_eq!(content.len(), 4);
        let right = content.splice(2);
        assert_eq!(content, Content::String("aé".into()));
        assert_eq!(right, Content::String("€b".into()));
    }

    #[test]
    fn refs_never_merge() {
        let mut a = Content::Ref {
            block_id: "b1".into(),
            block_type: TypeKind::Map,
        };
        let b = a.clone();
        assert!(!a.merge_with(&b));

        let mut u = Content::Unref {
            block_id: "b1".into(),
            client: 1,
            clock: 0,
        };
        let v = u.clone();
        assert!(!u.merge_with(&v));
    }

    #[test]
    fn json_runs_merge_and_splice() {
        let mut a = Content::Json(vec![json!(1), json!(2)]);
        let b = Content::Json(vec![json!(3)]);
        assert!(a.merge_with(&b));
        assert_eq!(a.len(), 3);
        let right = a.splice(1);
        assert_eq!(a, Content::Json(vec![json!(1)]));
        assert_eq!(right, Content::Json(vec![json!(2), json!(3)]));
    }
}
