//! FileIndex — the manifest mapping logical files onto the bulk region.
//!
//! The decrypted region-5 payload is an XML document: a `fileinfo` root with
//! one `file` element per partition image. Only the attributes below are
//! consumed; unknown attributes are ignored, missing required attributes are
//! fatal.

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IndexError {
    #[error("FileIndex is not valid XML: {0}")]
    Xml(String),
    #[error("FileIndex root element is not <fileinfo>")]
    BadRoot,
    #[error("file entry is missing required attribute {attr}")]
    MissingAttribute { attr: &'static str },
    #[error("attribute {attr} has invalid value {value:?}")]
    BadValue { attr: &'static str, value: String },
    #[error("file {name:?} declares a zero partition length")]
    ZeroPartitionLength { name: String },
}

/// One logical file inside the bulk region.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub name: String,
    /// Hex SHA-256 of the concatenated decompressed stream; verified.
    pub file_sha256: String,
    /// Hex SHA-256 of the post-processed (sparse-expanded) partition image;
    /// preserved for downstream tools, never checked here.
    pub partition_sha256: String,
    /// Starting KeyMap index; block *k* uses `key_index + k`.
    pub key_index: u64,
    pub sparse: bool,
    pub encrypted: bool,
    pub compressed: bool,
    /// Final decompressed size of the partition image.
    pub partition_length: u64,
    pub original_length: u64,
    /// Byte offset of the file's first block inside the bulk region.
    pub offset: u64,
    /// Bytes of the bulk region owned by this file (headers + ciphertext).
    pub length: u64,
}

/// Parse the FileIndex document into its entries.
pub fn parse_file_index(xml: &str) -> Result<Vec<FileEntry>, IndexError> {
    let mut reader = Reader::from_str(xml);
    let mut entries = Vec::new();
    let mut saw_root = false;

    loop {
        match reader.read_event().map_err(|e| IndexError::Xml(e.to_string()))? {
            Event::Start(ref e) | Event::Empty(ref e) => match e.name().as_ref() {
                b"fileinfo" if !saw_root => saw_root = true,
                b"file" if saw_root => entries.push(parse_file_element(e)?),
                _ if !saw_root => return Err(IndexError::BadRoot),
                // Unknown nested elements are ignored, like unknown attributes.
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(IndexError::BadRoot);
    }
    Ok(entries)
}

fn parse_file_element(e: &quick_xml::events::BytesStart<'_>) -> Result<FileEntry, IndexError> {
    let mut name = None;
    let mut file_sha256 = None;
    let mut partition_sha256 = None;
    let mut key_index = None;
    let mut sparse = None;
    let mut encrypted = None;
    let mut compressed = None;
    let mut partition_length = None;
    let mut original_length = None;
    let mut offset = None;
    let mut length = None;

    for attr in e.attributes() {
        let attr = attr.map_err(|e| IndexError::Xml(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| IndexError::Xml(e.to_string()))?
            .into_owned();
        match attr.key.as_ref() {
            b"Name" => name = Some(value),
            b"FileSha256Hash" => file_sha256 = Some(value),
            b"PartitionSha256Hash" => partition_sha256 = Some(value),
            b"KeyIndex" => key_index = Some(parse_u64("KeyIndex", &value)?),
            b"IsSparse" => sparse = Some(parse_bool("IsSparse", &value)?),
            b"IsEncrypted" => encrypted = Some(parse_bool("IsEncrypted", &value)?),
            b"IsCompressed" => compressed = Some(parse_bool("IsCompressed", &value)?),
            b"PartitionLength" => {
                partition_length = Some(parse_u64("PartitionLength", &value)?)
            }
            b"OriginalLength" => original_length = Some(parse_u64("OriginalLength", &value)?),
            b"Offset" => offset = Some(parse_u64("Offset", &value)?),
            b"Length" => length = Some(parse_u64("Length", &value)?),
            _ => {} // unknown attributes are ignored
        }
    }

    let entry = FileEntry {
        name: require(name, "Name")?,
        file_sha256: require(file_sha256, "FileSha256Hash")?,
        partition_sha256: require(partition_sha256, "PartitionSha256Hash")?,
        key_index: require(key_index, "KeyIndex")?,
        sparse: require(sparse, "IsSparse")?,
        encrypted: require(encrypted, "IsEncrypted")?,
        compressed: require(compressed, "IsCompressed")?,
        partition_length: require(partition_length, "PartitionLength")?,
        original_length: require(original_length, "OriginalLength")?,
        offset: require(offset, "Offset")?,
        length: require(length, "Length")?,
    };

    if entry.partition_length == 0 {
        return Err(IndexError::ZeroPartitionLength { name: entry.name });
    }
    Ok(entry)
}

fn require<T>(v: Option<T>, attr: &'static str) -> Result<T, IndexError> {
    v.ok_or(IndexError::MissingAttribute { attr })
}

fn parse_u64(attr: &'static str, value: &str) -> Result<u64, IndexError> {
    value
        .parse()
        .map_err(|_| IndexError::BadValue { attr, value: value.to_owned() })
}

fn parse_bool(attr: &'static str, value: &str) -> Result<bool, IndexError> {
    if value.eq_ignore_ascii_case("true") || value == "1" {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") || value == "0" {
        Ok(false)
    } else {
        Err(IndexError::BadValue { attr, value: value.to_owned() })
    }
}
