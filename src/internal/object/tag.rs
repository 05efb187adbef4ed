//! Annotated tag headers: `object <id>` and `type <kind>`.

use bstr::ByteSlice;

use crate::{
    errors::GitError,
    hash::{HashKind, ObjectId},
    internal::object::ObjectKind,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagTarget {
    pub object: ObjectId,
    pub kind: ObjectKind,
}

impl TagTarget {
    pub fn parse(hash: HashKind, data: &[u8]) -> Result<TagTarget, GitError> {
        let mut object = None;
        let mut kind = None;
        for line in data.lines() {
            if line.is_empty() {
                break;
            }
            if let Some(rest) = line.strip_prefix(b"object ") {
                let text = rest
                    .to_str()
                    .map_err(|_| GitError::InvalidTagObject("non-utf8 object id".to_string()))?;
                object =
                    Some(ObjectId::from_hex(hash, text.trim()).map_err(GitError::InvalidTagObject)?);
            } else if let Some(rest) = line.strip_prefix(b"type ") {
                let text = rest
                    .to_str()
                    .map_err(|_| GitError::InvalidTagObject("non-utf8 type".to_string()))?;
                kind = Some(ObjectKind::from_string(text.trim())?);
            }
        }
        match (object, kind) {
            (Some(object), Some(kind)) => Ok(TagTarget { object, kind }),
            _ => Err(GitError::InvalidTagObject(
                "missing object or type header".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TagTarget;
    use crate::{hash::HashKind, internal::object::ObjectKind};

    #[test]
    fn parse_tag_target() {
        let data = b"object 8ab686eafeb1f44702738c8b0f24f2567c36da6d\ntype commit\ntag v1.0\ntagger t <t@e> 1 +0000\n\nrelease\n";
        let tag = TagTarget::parse(HashKind::Sha1, data).unwrap();
        assert_eq!(tag.kind, ObjectKind::Commit);
        assert_eq!(
            tag.object.to_string(),
            "8ab686eafeb1f44702738c8b0f24f2567c36da6d"
        );
        assert!(TagTarget::parse(HashKind::Sha1, b"tag v1\n").is_err());
    }
}
