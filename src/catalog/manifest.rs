//! Manifest serialization: the JSON view, the compact binary view, and the
//! pre-compressed variants both are served from.

use bytes::Bytes;
use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use serde_json::{json, Map, Value};
use std::io::Write;

use super::Catalog;

/// Content codings the manifest is pre-compressed with. Deflate is always
/// built; further codecs are additive here and in [`compress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Deflate,
}

impl Encoding {
    pub fn token(self) -> &'static str {
        match self {
            Encoding::Deflate => "deflate",
        }
    }
}

/// One manifest view: the raw bytes plus whichever pre-compressed variants
/// came out smaller than the raw buffer this build cycle.
#[derive(Debug, Default, Clone)]
pub struct ViewBuf {
    pub plain: Bytes,
    pub compressed: Vec<(Encoding, Bytes)>,
}

/// The full set of serialized manifest buffers, swapped in atomically on
/// rebuild. Readers clone the owning `Arc` and serve from the snapshot.
#[derive(Debug, Default, Clone)]
pub struct ManifestSet {
    pub json: ViewBuf,
    pub bin: ViewBuf,
    pub last_modified: i64,
}

impl ManifestSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.json.plain.is_empty()
    }
}

/// Serialize both views of the catalog and compress each.
pub(super) fn build_set(catalog: &Catalog) -> ManifestSet {
    let json = build_view(build_json(catalog));
    let bin = build_view(build_binary(catalog));
    ManifestSet {
        json,
        bin,
        last_modified: catalog.timestamp,
    }
}

fn build_view(plain: Vec<u8>) -> ViewBuf {
    let mut compressed = Vec::new();
    if let Some(deflated) = compress(Encoding::Deflate, &plain) {
        compressed.push((Encoding::Deflate, Bytes::from(deflated)));
    }
    ViewBuf {
        plain: Bytes::from(plain),
        compressed,
    }
}

/// Compress at the highest quality; a failed or non-shrinking result is
/// discarded for this build cycle.
fn compress(encoding: Encoding, plain: &[u8]) -> Option<Vec<u8>> {
    let out = match encoding {
        Encoding::Deflate => {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::best());
            enc.write_all(plain).ok()?;
            enc.finish().ok()?
        }
    };
    (out.len() < plain.len()).then_some(out)
}

fn build_json(catalog: &Catalog) -> Vec<u8> {
    let mut apps = Map::new();
    for (app_id, app) in catalog.apps() {
        let mut entry = Map::new();
        entry.insert("name".into(), Value::from(app.name.as_str()));
        if app.pics_at != 0 {
            entry.insert("pics_at".into(), Value::from(app.pics_at));
        }
        entry.insert(
            "depots".into(),
            Value::from(app.depots.keys().copied().collect::<Vec<u32>>()),
        );
        apps.insert(app_id.to_string(), Value::Object(entry));
    }
    let mut depot_keys = Map::new();
    for (depot_id, key) in catalog.depot_keys() {
        depot_keys.insert(depot_id.to_string(), Value::from(base64::encode(key)));
    }
    serde_json::to_vec(&json!({ "apps": apps, "depot_keys": depot_keys }))
        .expect("manifest JSON serialization cannot fail")
}

/// Binary view layout, all fields little-endian:
///
/// ```text
/// hdr   { u32 crc; i32 n_apps; i32 n_depots; i32 n_keys; }
/// app   { u64 pics_access_token; i32 name_len; i32 n_depots; } [n_apps]
/// u32   depot_ids[n_depots]          // concatenated per app
/// key   { i32 depot_id; u8 key[32]; } [n_keys]
/// char  names[...]                   // concatenated, not null-terminated
/// ```
///
/// `crc` is CRC-32 (zlib polynomial) over every byte past the crc field.
fn build_binary(catalog: &Catalog) -> Vec<u8> {
    let mut buf = Vec::new();
    let n_depots: usize = catalog.apps().values().map(|app| app.depots.len()).sum();
    buf.write_u32::<LittleEndian>(0).unwrap();
    buf.write_i32::<LittleEndian>(catalog.apps().len() as i32).unwrap();
    buf.write_i32::<LittleEndian>(n_depots as i32).unwrap();
    buf.write_i32::<LittleEndian>(catalog.depot_keys().len() as i32).unwrap();
    for app in catalog.apps().values() {
        buf.write_u64::<LittleEndian>(app.pics_at).unwrap();
        buf.write_i32::<LittleEndian>(app.name.len() as i32).unwrap();
        buf.write_i32::<LittleEndian>(app.depots.len() as i32).unwrap();
    }
    for app in catalog.apps().values() {
        for depot_id in app.depots.keys() {
            buf.write_u32::<LittleEndian>(*depot_id).unwrap();
        }
    }
    for (depot_id, key) in catalog.depot_keys() {
        buf.write_i32::<LittleEndian>(*depot_id as i32).unwrap();
        buf.extend_from_slice(key);
    }
    for app in catalog.apps().values() {
        buf.extend_from_slice(app.name.as_bytes());
    }
    let mut crc = Crc::new();
    crc.update(&buf[4..]);
    buf[..4].copy_from_slice(&crc.sum().to_le_bytes());
    buf
}

/// Pick the response encoding: of the supported codecs present in the
/// client's `Accept-Encoding` list, the one with the smallest buffer that
/// is strictly smaller than the identity buffer. `None` means identity.
pub fn negotiate<'a>(accept: &str, view: &'a ViewBuf) -> Option<(Encoding, &'a Bytes)> {
    if accept.is_empty() {
        return None;
    }
    let offered: Vec<&str> = accept
        .split(',')
        .filter_map(|item| item.split(';').next())
        .map(str::trim)
        .collect();
    let mut best: Option<(Encoding, &Bytes)> = None;
    let mut best_size = view.plain.len();
    for (encoding, bytes) in &view.compressed {
        if bytes.len() < best_size
            && offered.iter().any(|o| o.eq_ignore_ascii_case(encoding.token()))
        {
            best_size = bytes.len();
            best = Some((*encoding, bytes));
        }
    }
    best
}
