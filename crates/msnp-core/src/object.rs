//! Content descriptors ("msn objects").
//!
//! A [`ContentDescriptor`] names a piece of content (avatar, custom emoticon,
//! file, activity payload) by the SHA-256 hash of its bytes. Two descriptors
//! with the same hash are the same object, whoever announced them, so
//! equality and hashing only look at [`ObjectHash`].
//!
//! On the wire a descriptor is an XML element:
//!
//! ```text
//! <msnobj Creator="bob@example.com" Size="5120" Type="3" Location="0" Friendly="YQA=" SHA256D="…"/>
//! ```
//!
//! URL-encoded when it travels as a frame parameter.

use std::fmt;
use std::hash::{Hash, Hasher};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors produced while parsing descriptors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ObjectError {
    /// The XML could not be read.
    #[error("invalid descriptor xml: {0}")]
    Xml(String),

    /// The element is missing a required attribute.
    #[error("descriptor is missing attribute {0}")]
    MissingAttribute(&'static str),

    /// An attribute had an unusable value.
    #[error("descriptor attribute {name} has invalid value {value:?}")]
    InvalidAttribute { name: &'static str, value: String },

    /// No `<msnobj>` element was found.
    #[error("no msnobj element found")]
    NotFound,
}

/// SHA-256 hash identifying a content object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHash([u8; 32]);

impl ObjectHash {
    /// Hashes the given content.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Wraps raw hash bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Standard base64 form used in descriptors.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parses the base64 form.
    pub fn from_base64(value: &str) -> Result<Self, ObjectError> {
        let invalid = || ObjectError::InvalidAttribute {
            name: "SHA256D",
            value: value.to_string(),
        };
        let bytes = BASE64.decode(value).map_err(|_| invalid())?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHash({})", self.to_base64())
    }
}

/// Type tag of a content object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// Custom emoticon.
    Emoticon,
    /// Display picture.
    Avatar,
    /// File offered for transfer.
    File,
    /// Activity (application) payload.
    Activity,
}

impl ObjectKind {
    /// Numeric `Type` attribute value.
    pub fn code(self) -> u8 {
        match self {
            Self::Emoticon => 2,
            Self::Avatar => 3,
            Self::File => 4,
            Self::Activity => 5,
        }
    }

    /// Maps a `Type` attribute value back to a kind.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            2 => Some(Self::Emoticon),
            3 => Some(Self::Avatar),
            4 => Some(Self::File),
            5 => Some(Self::Activity),
            _ => None,
        }
    }

    /// Short lowercase name, as used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emoticon => "emoticon",
            Self::Avatar => "avatar",
            Self::File => "file",
            Self::Activity => "activity",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content-addressed identifier of an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentDescriptor {
    /// Account that owns the object.
    pub creator: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Type tag.
    pub kind: ObjectKind,
    /// Human-readable name (file name, emoticon shortcut, ...).
    pub friendly: String,
    /// Hash of the content.
    pub hash: ObjectHash,
}

impl PartialEq for ContentDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for ContentDescriptor {}

impl Hash for ContentDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl ContentDescriptor {
    /// Describes `data`, computing its size and hash.
    pub fn for_content(
        creator: impl Into<String>,
        kind: ObjectKind,
        friendly: impl Into<String>,
        data: &[u8],
    ) -> Self {
        Self {
            creator: creator.into(),
            size: data.len() as u64,
            kind,
            friendly: friendly.into(),
            hash: ObjectHash::of(data),
        }
    }

    /// Returns true if `data` is exactly the content this descriptor names.
    pub fn matches(&self, data: &[u8]) -> bool {
        data.len() as u64 == self.size && ObjectHash::of(data) == self.hash
    }

    /// Serializes to the `<msnobj/>` element.
    pub fn to_xml(&self) -> String {
        let friendly = BASE64.encode(self.friendly.as_bytes());
        format!(
            r#"<msnobj Creator="{}" Size="{}" Type="{}" Location="0" Friendly="{}" SHA256D="{}"/>"#,
            escape(self.creator.as_str()),
            self.size,
            self.kind.code(),
            friendly,
            self.hash.to_base64(),
        )
    }

    /// URL-encoded form used as a frame parameter.
    pub fn to_param(&self) -> String {
        urlencoding::encode(&self.to_xml()).into_owned()
    }

    /// Parses the URL-encoded frame parameter form.
    pub fn from_param(param: &str) -> Result<Self, ObjectError> {
        let xml = urlencoding::decode(param).map_err(|e| ObjectError::Xml(e.to_string()))?;
        Self::parse(&xml)
    }

    /// Parses an `<msnobj/>` element.
    pub fn parse(xml: &str) -> Result<Self, ObjectError> {
        let mut reader = Reader::from_str(xml);
        loop {
            match reader.read_event() {
                Ok(Event::Empty(element)) | Ok(Event::Start(element))
                    if element.name().as_ref() == b"msnobj" =>
                {
                    let mut creator = None;
                    let mut size = None;
                    let mut kind = None;
                    let mut friendly = String::new();
                    let mut hash = None;

                    for attribute in element.attributes() {
                        let attribute = attribute.map_err(|e| ObjectError::Xml(e.to_string()))?;
                        let value = attribute
                            .unescape_value()
                            .map_err(|e| ObjectError::Xml(e.to_string()))?
                            .into_owned();
                        match attribute.key.as_ref() {
                            b"Creator" => creator = Some(value),
                            b"Size" => {
                                size = Some(value.parse::<u64>().map_err(|_| {
                                    ObjectError::InvalidAttribute { name: "Size", value }
                                })?)
                            }
                            b"Type" => {
                                let parsed = value.parse::<u8>().ok().and_then(ObjectKind::from_code);
                                kind = Some(parsed.ok_or(ObjectError::InvalidAttribute {
                                    name: "Type",
                                    value,
                                })?)
                            }
                            b"Friendly" => {
                                friendly = BASE64
                                    .decode(&value)
                                    .ok()
                                    .and_then(|bytes| String::from_utf8(bytes).ok())
                                    .unwrap_or_default()
                            }
                            b"SHA256D" => hash = Some(ObjectHash::from_base64(&value)?),
                            _ => {}
                        }
                    }

                    return Ok(Self {
                        creator: creator.ok_or(ObjectError::MissingAttribute("Creator"))?,
                        size: size.ok_or(ObjectError::MissingAttribute("Size"))?,
                        kind: kind.ok_or(ObjectError::MissingAttribute("Type"))?,
                        friendly,
                        hash: hash.ok_or(ObjectError::MissingAttribute("SHA256D"))?,
                    });
                }
                Ok(Event::Eof) => return Err(ObjectError::NotFound),
                Ok(_) => {}
                Err(e) => return Err(ObjectError::Xml(e.to_string())),
            }
        }
    }
}

impl fmt::Display for ContentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} from {} ({} bytes, {})",
            self.kind, self.friendly, self.creator, self.size, self.hash
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avatar() -> ContentDescriptor {
        ContentDescriptor::for_content("bob@example.com", ObjectKind::Avatar, "me.png", b"png bytes")
    }

    #[test]
    fn for_content_computes_size_and_hash() {
        let descriptor = avatar();
        assert_eq!(descriptor.size, 9);
        assert_eq!(descriptor.hash, ObjectHash::of(b"png bytes"));
        assert!(descriptor.matches(b"png bytes"));
        assert!(!descriptor.matches(b"png bytez"));
    }

    #[test]
    fn xml_roundtrip() {
        let descriptor = avatar();
        let parsed = ContentDescriptor::parse(&descriptor.to_xml()).unwrap();
        assert_eq!(parsed.creator, "bob@example.com");
        assert_eq!(parsed.size, 9);
        assert_eq!(parsed.kind, ObjectKind::Avatar);
        assert_eq!(parsed.friendly, "me.png");
        assert_eq!(parsed.hash, descriptor.hash);
    }

    #[test]
    fn param_form_has_no_spaces() {
        let param = avatar().to_param();
        assert!(!param.contains(' '));
        assert_eq!(ContentDescriptor::from_param(&param).unwrap(), avatar());
    }

    #[test]
    fn creator_is_escaped() {
        let descriptor =
            ContentDescriptor::for_content("a\"<b>@example.com", ObjectKind::File, "x", b"1");
        let parsed = ContentDescriptor::parse(&descriptor.to_xml()).unwrap();
        assert_eq!(parsed.creator, "a\"<b>@example.com");
    }

    #[test]
    fn equality_is_by_hash_only() {
        let mut other = avatar();
        other.creator = "carol@example.com".to_string();
        other.friendly = "copy.png".to_string();
        assert_eq!(other, avatar());

        let different = ContentDescriptor::for_content("bob@example.com", ObjectKind::Avatar, "me.png", b"other");
        assert_ne!(different, avatar());
    }

    #[test]
    fn parse_rejects_missing_hash() {
        let err = ContentDescriptor::parse(r#"<msnobj Creator="a" Size="1" Type="3"/>"#).unwrap_err();
        assert_eq!(err, ObjectError::MissingAttribute("SHA256D"));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let xml = format!(
            r#"<msnobj Creator="a" Size="1" Type="99" SHA256D="{}"/>"#,
            ObjectHash::of(b"1").to_base64()
        );
        assert!(matches!(
            ContentDescriptor::parse(&xml),
            Err(ObjectError::InvalidAttribute { name: "Type", .. })
        ));
    }

    #[test]
    fn parse_without_element() {
        assert_eq!(ContentDescriptor::parse("<other/>"), Err(ObjectError::NotFound));
    }

    #[test]
    fn kind_codes_roundtrip() {
        for kind in [ObjectKind::Emoticon, ObjectKind::Avatar, ObjectKind::File, ObjectKind::Activity] {
            assert_eq!(ObjectKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ObjectKind::from_code(0), None);
    }

    #[test]
    fn descriptor_serializes_to_json() {
        let json = serde_json::to_value(avatar()).unwrap();
        assert_eq!(json["kind"], "avatar");
        assert_eq!(json["size"], 9);
    }
}
