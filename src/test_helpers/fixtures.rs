use std::io::{Cursor, Write};
use std::path::PathBuf;

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::TestContext;
use crate::dfu::config::MANIFEST_FILENAME;

/// Builder for distribution package archives
pub struct FirmwareZipBuilder {
    manifest: Option<String>,
    files: Vec<(String, Vec<u8>)>,
}

impl FirmwareZipBuilder {
    pub fn new() -> Self {
        Self {
            manifest: None,
            files: Vec::new(),
        }
    }

    /// Add a manifest.json with the given content
    pub fn manifest(mut self, json: &str) -> Self {
        self.manifest = Some(json.to_string());
        self
    }

    pub fn file(mut self, name: &str, content: &[u8]) -> Self {
        self.files.push((name.to_string(), content.to_vec()));
        self
    }

    /// Zip everything in memory
    pub fn build_bytes(self) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);

        if let Some(manifest) = &self.manifest {
            zip.start_file(MANIFEST_FILENAME, options)
                .expect("Failed to start manifest");
            zip.write_all(manifest.as_bytes())
                .expect("Failed to write manifest");
        }
        for (name, content) in &self.files {
            zip.start_file(name.as_str(), options)
                .expect("Failed to start file");
            zip.write_all(content).expect("Failed to write file");
        }

        zip.finish().expect("Failed to finish zip").into_inner()
    }

    /// Write the archive into the test context
    pub fn write_to(self, ctx: &TestContext, name: &str) -> PathBuf {
        ctx.create_file_bytes(name, &self.build_bytes())
    }
}

impl Default for FirmwareZipBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Intel HEX data record line (type 00) with a valid checksum
pub fn hex_data_record(offset: u16, data: &[u8]) -> String {
    let [hi, lo] = offset.to_be_bytes();
    let mut bytes = vec![data.len() as u8, hi, lo, 0x00];
    bytes.extend_from_slice(data);
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    bytes.push(sum.wrapping_neg());

    let body: String = bytes.iter().map(|b| format!("{:02X}", b)).collect();
    format!(":{}\n", body)
}
