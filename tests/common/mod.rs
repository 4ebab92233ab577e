//! Synthetic NTPI archive builder for the integration tests.
//!
//! Produces bit-exact containers: FileHeader, chained encrypted metadata
//! regions (PKCS#7 padded), a bulk region of EncodeHeader blocks whose
//! ciphertext decrypts to DecompressHeader + raw LZMA2 streams, and a
//! FileIndex naming it all.

use aes::Aes256;
use byteorder::{LittleEndian, WriteBytesExt};
use cbc::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use xz2::stream::{Action, Filters, LzmaOptions, Status, Stream};

use ntpi::keys;

pub const ENCODE_HEADER_SIZE: usize = 112;

#[derive(Clone)]
pub struct FileSpec {
    pub name: String,
    pub data: Vec<u8>,
    pub key_index: u64,
    pub chunk_size: usize,
}

pub struct ArchiveSpec {
    pub version: (u64, u64, u64),
    pub keymap: Vec<u8>,
    pub files: Vec<FileSpec>,
}

impl Default for ArchiveSpec {
    fn default() -> Self {
        Self {
            version: (1, 3, 0),
            keymap: (0u8..=255).cycle().take(96).collect(),
            files: Vec::new(),
        }
    }
}

pub struct BuiltEntry {
    pub name: String,
    pub key_index: u64,
    /// Offset of the file's first block inside the bulk region.
    pub offset: u64,
    /// Bytes of the bulk region owned by the file.
    pub length: u64,
    pub sha256: String,
    pub data_len: u64,
}

pub struct BuiltArchive {
    pub bytes: Vec<u8>,
    pub entries: Vec<BuiltEntry>,
    /// Archive offset of the bulk region (for targeted tampering).
    pub region6_offset: u64,
    pub region6: Vec<u8>,
    pub keymap: Vec<u8>,
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn pkcs7_pad(buf: &mut Vec<u8>) {
    let pad = 16 - buf.len() % 16;
    buf.extend(std::iter::repeat(pad as u8).take(pad));
}

fn encrypt_cbc_256(pt: &[u8], key: &[u8; 32], iv: &[u8; 16]) -> Vec<u8> {
    assert_eq!(pt.len() % 16, 0);
    let mut buf = pt.to_vec();
    let enc = cbc::Encryptor::<Aes256>::new_from_slices(key, iv).unwrap();
    enc.encrypt_padded_mut::<NoPadding>(&mut buf, pt.len()).unwrap();
    buf
}

// Raw LZMA2 stream (no XZ container) via liblzma's raw encoder.
fn lzma2_compress(data: &[u8]) -> Vec<u8> {
    let opts = LzmaOptions::new_preset(6).unwrap();
    let mut filters = Filters::new();
    filters.lzma2(&opts);
    let mut stream = Stream::new_raw_encoder(&filters).unwrap();

    let mut out = Vec::with_capacity(data.len() + 1024);
    loop {
        let consumed = stream.total_in() as usize;
        let status = stream
            .process_vec(&data[consumed..], &mut out, Action::Finish)
            .unwrap();
        match status {
            Status::StreamEnd => return out,
            _ => {
                if out.len() == out.capacity() {
                    out.reserve(out.capacity().max(1024));
                }
            }
        }
    }
}

/// EncodeHeader for one bulk block.
fn encode_header(processed: u64, original: u64, iv: &[u8; 16]) -> Vec<u8> {
    let mut h = Vec::with_capacity(ENCODE_HEADER_SIZE);
    h.extend_from_slice(b"NTENCODE");
    for tag in [1u32, 2, 3, 0] {
        h.write_u32::<LittleEndian>(tag).unwrap();
    }
    h.write_u64::<LittleEndian>(processed).unwrap();
    h.write_u64::<LittleEndian>(original).unwrap();
    h.extend_from_slice(&[0u8; 32]); // embedded key, unused
    h.extend_from_slice(iv);
    h.extend_from_slice(&[0u8; 16]); // rest of the IV field
    h.write_u32::<LittleEndian>(processed as u32).unwrap();
    h.write_u32::<LittleEndian>(original as u32).unwrap();
    assert_eq!(h.len(), ENCODE_HEADER_SIZE);
    h
}

/// DecompressHeader prefixed to the compressed stream before encryption.
fn decompress_header(processed: u64, original: u64) -> Vec<u8> {
    let mut h = Vec::with_capacity(ENCODE_HEADER_SIZE);
    h.extend_from_slice(b"NTENCODE");
    for tag in [1u32, 2, 3, 0] {
        h.write_u32::<LittleEndian>(tag).unwrap();
    }
    h.write_u64::<LittleEndian>(processed).unwrap();
    h.write_u64::<LittleEndian>(original).unwrap();
    h.extend_from_slice(&[0u8; 72]);
    assert_eq!(h.len(), ENCODE_HEADER_SIZE);
    h
}

/// Build one bulk block: EncodeHeader + AES-CBC(DecompressHeader + LZMA2).
pub fn build_block(chunk: &[u8], key: &[u8; 32], iv: &[u8; 16]) -> Vec<u8> {
    let compressed = lzma2_compress(chunk);
    let mut inner = decompress_header(chunk.len() as u64, compressed.len() as u64);
    inner.extend_from_slice(&compressed);
    pkcs7_pad(&mut inner);
    let ct = encrypt_cbc_256(&inner, key, iv);

    let mut block = encode_header(chunk.len() as u64, ct.len() as u64, iv);
    block.extend_from_slice(&ct);
    block
}

/// Build the bulk region for a set of files, returning the blob plus the
/// per-file index facts.
pub fn build_region6(keymap: &[u8], files: &[FileSpec]) -> (Vec<u8>, Vec<BuiltEntry>) {
    let mut region6 = Vec::new();
    let mut entries = Vec::new();

    for file in files {
        let offset = region6.len() as u64;
        for (k, chunk) in file.data.chunks(file.chunk_size.max(1)).enumerate() {
            let key = keys::extract_key(keymap, file.key_index + k as u64).unwrap();
            let mut iv = [0u8; 16];
            iv[0] = 0x51;
            iv[1] = k as u8;
            region6.extend_from_slice(&build_block(chunk, &key, &iv));
        }
        entries.push(BuiltEntry {
            name: file.name.clone(),
            key_index: file.key_index,
            offset,
            length: region6.len() as u64 - offset,
            sha256: sha256_hex(&file.data),
            data_len: file.data.len() as u64,
        });
    }
    (region6, entries)
}

pub fn file_index_xml(entries: &[BuiltEntry]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\"?>\n<fileinfo>\n");
    for e in entries {
        xml.push_str(&format!(
            "  <file Name=\"{}\" FileSha256Hash=\"{}\" PartitionSha256Hash=\"{}\" \
             KeyIndex=\"{}\" IsSparse=\"False\" IsEncrypted=\"True\" IsCompressed=\"True\" \
             PartitionLength=\"{}\" OriginalLength=\"{}\" Offset=\"{}\" Length=\"{}\"/>\n",
            e.name, e.sha256, e.sha256, e.key_index, e.data_len, e.data_len, e.offset, e.length,
        ));
    }
    xml.push_str("</fileinfo>\n");
    xml
}

fn region_header(region_type: u64, region_size: u64) -> Vec<u8> {
    let mut h = Vec::with_capacity(16);
    h.write_u64::<LittleEndian>(region_type).unwrap();
    h.write_u64::<LittleEndian>(region_size).unwrap();
    h
}

// Ciphertext size of a metadata region holding `payload_len` bytes:
// 40-byte RegionBlockHeader + payload, PKCS#7 padded (pad always added).
fn region_ct_size(payload_len: usize) -> u64 {
    let raw = 40 + payload_len;
    (raw + (16 - raw % 16)) as u64
}

/// Assemble a complete archive: FileHeader, regions 1..=5, bulk region.
pub fn build_archive(spec: &ArchiveSpec) -> BuiltArchive {
    let (region6, entries) = build_region6(&spec.keymap, &spec.files);
    let index_xml = file_index_xml(&entries);

    let payloads: [(u64, Vec<u8>); 5] = [
        (1, b"<metadata><device name=\"test\"/></metadata>".to_vec()),
        (2, b"<patch version=\"1\"></patch>".to_vec()),
        (3, b"<data><program label=\"abl\"/></data>".to_vec()),
        (4, spec.keymap.clone()),
        (5, index_xml.into_bytes()),
    ];

    // Region chain headers, including the terminating bulk region.
    let mut headers: Vec<Vec<u8>> = payloads
        .iter()
        .map(|(t, p)| region_header(*t, region_ct_size(p.len())))
        .collect();
    headers.push(region_header(6, region6.len() as u64));

    let (keyset, _) = keys::lookup(spec.version);

    let mut archive = Vec::new();
    archive.extend_from_slice(b"NTPI");
    archive.extend_from_slice(&[0u8; 4]);
    archive.write_u64::<LittleEndian>(spec.version.0).unwrap();
    archive.write_u64::<LittleEndian>(spec.version.1).unwrap();
    archive.write_u64::<LittleEndian>(spec.version.2).unwrap();
    archive.extend_from_slice(&headers[0]);
    assert_eq!(archive.len(), 48);

    for (i, (region_type, payload)) in payloads.iter().enumerate() {
        let mut pt = Vec::new();
        pt.extend_from_slice(&headers[i]); // this_header
        pt.extend_from_slice(&headers[i + 1]); // next_header
        pt.write_u64::<LittleEndian>(payload.len() as u64).unwrap();
        pt.extend_from_slice(payload);
        pkcs7_pad(&mut pt);

        let rk = keyset.region(*region_type).unwrap();
        archive.extend_from_slice(&encrypt_cbc_256(&pt, &rk.key, &rk.iv));
    }

    let region6_offset = archive.len() as u64;
    archive.extend_from_slice(&region6);

    BuiltArchive {
        bytes: archive,
        entries,
        region6_offset,
        region6,
        keymap: spec.keymap.clone(),
    }
}

/// Deterministic pseudo-random-ish but compressible payload.
pub fn sample_data(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i / 64) as u8).wrapping_mul(31))
        .collect()
}

/// Deterministic incompressible payload (xorshift). liblzma stores such
/// input as uncompressed LZMA2 chunks.
pub fn random_data(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}
