//! Archive packing and unpacking for backup instances.
//!
//! Every archive is a tar stream, compressed, optionally sealed, and
//! checksummed as it is written:
//!
//! ```text
//! tar -> compressor -> cipher -> checksum -> file
//! ```
//!
//! An archive may be stored as several numbered parts (`data0.tar.gz.0`,
//! `data0.tar.gz.1`, ...), each sealed on its own. Reading checks the
//! checksum of every part first, then opens the parts one after another and
//! decompresses their concatenated plaintext.

use crate::compression::{
    calculate_checksum, ArchiveFormat, ChecksumWriter, Compressor, Decompressor,
    DEFAULT_COMPRESSION_LEVEL,
};
use crate::crypto::{CipherReader, CryptoCodec};
use crate::filters::ExclusionConfig;
use appkeep_core::{Error, Result};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder as TarBuilder};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Result of packing one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedArchive {
    /// File name inside the instance directory
    pub file_name: String,

    /// Hex SHA256 of the stored bytes
    pub checksum: String,

    /// Number of tar entries (files, directories, links)
    pub entries: u64,

    /// Size of the stored file
    pub size_bytes: u64,
}

impl PackedArchive {
    /// The stored file as a single part under `dir`
    pub fn part(&self, dir: &Path) -> ArchivePart {
        ArchivePart::new(dir.join(&self.file_name), &self.checksum)
    }
}

/// One stored file of an archive and the checksum recorded for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePart {
    pub path: PathBuf,
    pub checksum: String,
}

impl ArchivePart {
    pub fn new(path: impl Into<PathBuf>, checksum: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            checksum: checksum.into(),
        }
    }

    /// Compares the stored bytes with the recorded checksum.
    fn check(&self) -> Result<()> {
        let actual = calculate_checksum(&self.path)?;
        if !actual.eq_ignore_ascii_case(&self.checksum) {
            return Err(Error::checksum_mismatch(
                archive_file_label(&self.path),
                self.checksum.as_str(),
                actual,
            ));
        }
        Ok(())
    }
}

/// Plaintext of consecutive parts, each opened with its own cipher header.
struct PartsReader<'a> {
    crypto: &'a CryptoCodec,
    pending: std::vec::IntoIter<PathBuf>,
    current: Option<CipherReader<BufReader<File>>>,
}

impl<'a> PartsReader<'a> {
    fn new(crypto: &'a CryptoCodec, parts: &[ArchivePart]) -> Self {
        let paths: Vec<PathBuf> = parts.iter().map(|p| p.path.clone()).collect();
        Self {
            crypto,
            pending: paths.into_iter(),
            current: None,
        }
    }
}

impl Read for PartsReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                let n = reader.read(buf)?;
                if n > 0 || buf.is_empty() {
                    return Ok(n);
                }
                self.current = None;
            }
            match self.pending.next() {
                Some(path) => {
                    trace!("Opening part {:?}", path);
                    let file = BufReader::new(File::open(&path)?);
                    self.current = Some(self.crypto.open(file)?);
                }
                None => return Ok(0),
            }
        }
    }
}

/// Configuration for archive creation and extraction.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Compression format
    pub format: ArchiveFormat,

    /// Paths skipped on pack and on unpack
    pub exclusions: ExclusionConfig,

    /// Compression level (1-9)
    pub compression_level: u32,

    /// When set, only files with this extension are packed
    pub only_extension: Option<String>,
}

impl ArchiveConfig {
    /// Creates a new archive configuration.
    pub fn new(format: ArchiveFormat) -> Result<Self> {
        Ok(Self {
            format,
            exclusions: ExclusionConfig::new(false, &[])?,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            only_extension: None,
        })
    }

    /// Replaces the exclusion set.
    pub fn with_exclusions(mut self, exclusions: ExclusionConfig) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Sets the compression level.
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.clamp(1, 9);
        self
    }

    /// Restricts packing to files with `extension`.
    pub fn with_only_extension(mut self, extension: impl Into<String>) -> Self {
        self.only_extension = Some(extension.into());
        self
    }
}

type ArchiveWriter = Compressor<crate::crypto::CipherWriter<ChecksumWriter<BufWriter<File>>>>;
type ArchiveReader<'a> = Decompressor<PartsReader<'a>>;

/// Packs and unpacks the archives of one instance.
pub struct ArchiveCodec {
    config: ArchiveConfig,
    crypto: CryptoCodec,
}

impl ArchiveCodec {
    pub fn new(config: ArchiveConfig, crypto: CryptoCodec) -> Self {
        Self { config, crypto }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Stored file name for an archive with `prefix`
    pub fn file_name(&self, prefix: &str) -> String {
        crate::metadata::archive_file_name(prefix, self.config.format, self.crypto.mode())
    }

    /// Packs the contents of `source_dir` into `<output_dir>/<prefix><ext>`.
    ///
    /// A missing `source_dir` yields an archive with zero entries.
    pub fn pack_directory(
        &self,
        source_dir: &Path,
        output_dir: &Path,
        prefix: &str,
    ) -> Result<PackedArchive> {
        let entries = self.scan_directory(source_dir)?;
        let named: Vec<(PathBuf, PathBuf)> = entries
            .into_iter()
            .map(|rel| (source_dir.join(&rel), rel))
            .collect();
        self.write_archive(&named, output_dir, prefix)
    }

    /// Packs individual files under the given entry names.
    pub fn pack_files(
        &self,
        files: &[(PathBuf, String)],
        output_dir: &Path,
        prefix: &str,
    ) -> Result<PackedArchive> {
        let named: Vec<(PathBuf, PathBuf)> = files
            .iter()
            .map(|(path, name)| (path.clone(), PathBuf::from(name)))
            .collect();
        self.write_archive(&named, output_dir, prefix)
    }

    /// Lists relative paths under `source_dir` to pack, parents before children.
    fn scan_directory(&self, source_dir: &Path) -> Result<Vec<PathBuf>> {
        if !source_dir.exists() {
            debug!("Skipping non-existent path: {:?}", source_dir);
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(source_dir)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                let rel_path = e.path().strip_prefix(source_dir).unwrap_or(e.path());
                !self.config.exclusions.should_exclude(rel_path)
            })
        {
            let entry = entry.map_err(|e| {
                Error::partial_capture(source_dir.display().to_string(), e.to_string())
            })?;
            let rel_path = entry
                .path()
                .strip_prefix(source_dir)
                .map_err(|e| Error::partial_capture(entry.path().display().to_string(), e.to_string()))?;

            if let Some(extension) = &self.config.only_extension {
                let matches = entry.file_type().is_file()
                    && rel_path.extension().and_then(|e| e.to_str()) == Some(extension.as_str());
                if !matches {
                    continue;
                }
            }
            paths.push(rel_path.to_path_buf());
        }
        Ok(paths)
    }

    fn write_archive(
        &self,
        entries: &[(PathBuf, PathBuf)],
        output_dir: &Path,
        prefix: &str,
    ) -> Result<PackedArchive> {
        let file_name = self.file_name(prefix);
        let output_path = output_dir.join(&file_name);

        let file = File::create(&output_path)?;
        let checksum_writer = ChecksumWriter::new(BufWriter::new(file));
        let cipher = self.crypto.seal(checksum_writer)?;
        let compressor: ArchiveWriter =
            Compressor::new(self.config.format, cipher, self.config.compression_level)?;

        let mut tar = TarBuilder::new(compressor);
        tar.follow_symlinks(false);

        let mut count = 0u64;
        for (source, name) in entries {
            tar.append_path_with_name(source, name).map_err(|e| {
                Error::partial_capture(source.display().to_string(), e.to_string())
            })?;
            trace!("Packed {:?}", name);
            count += 1;
        }

        let compressor = tar.into_inner()?;
        let cipher = compressor.finish()?;
        let checksum_writer = cipher.finish()?;
        let (buffered, checksum) = checksum_writer.finish()?;
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        let size_bytes = fs::metadata(&output_path)?.len();
        debug!("Packed {} ({} entries, {} bytes)", file_name, count, size_bytes);

        Ok(PackedArchive {
            file_name,
            checksum,
            entries: count,
            size_bytes,
        })
    }

    /// Checks every part, then opens the decoded stream of all of them.
    fn open_archive(&self, parts: &[ArchivePart]) -> Result<Archive<ArchiveReader<'_>>> {
        let Some(first) = parts.first() else {
            return Err(Error::integrity_violation("archive", "no stored parts"));
        };
        for part in parts {
            part.check()?;
        }
        if parts.len() > 1 {
            debug!("Reading {} in {} parts", archive_file_label(&first.path), parts.len());
        }
        let decompressor = Decompressor::new(self.config.format, PartsReader::new(&self.crypto, parts))?;
        Ok(Archive::new(decompressor))
    }

    /// Decodes whatever follows the last tar entry so trailing damage is reported.
    fn finish_reading(archive: Archive<ArchiveReader<'_>>) -> Result<()> {
        let mut decompressor = archive.into_inner();
        io::copy(&mut decompressor, &mut io::sink())?;
        Ok(())
    }

    /// Extracts the archive stored in `parts` into `dest`.
    ///
    /// Checksums are compared before anything is written. Excluded paths
    /// are skipped. Returns the number of entries written.
    pub fn unpack(&self, parts: &[ArchivePart], dest: &Path) -> Result<u64> {
        let mut archive = self.open_archive(parts)?;
        fs::create_dir_all(dest)?;
        archive.set_preserve_permissions(true);
        archive.set_overwrite(true);

        let mut count = 0u64;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let path = entry.path()?.into_owned();
            if self.config.exclusions.should_exclude(&path) {
                trace!("Skipping excluded entry {:?}", path);
                continue;
            }
            if entry.unpack_in(dest)? {
                count += 1;
            } else {
                debug!("Skipped entry outside destination: {:?}", path);
            }
        }

        Self::finish_reading(archive)?;
        Ok(count)
    }

    /// Decodes the archive fully without writing anything.
    pub fn verify(&self, parts: &[ArchivePart]) -> Result<u64> {
        let mut archive = self.open_archive(parts)?;
        let mut count = 0u64;
        for entry in archive.entries()? {
            let mut entry = entry?;
            io::copy(&mut entry, &mut io::sink())?;
            count += 1;
        }
        Self::finish_reading(archive)?;
        Ok(count)
    }

    /// Writes `content` sealed but uncompressed, returning the stored checksum.
    pub fn write_sealed_payload(&self, dir: &Path, file_name: &str, content: &[u8]) -> Result<String> {
        let file = File::create(dir.join(file_name))?;
        let mut cipher = self.crypto.seal(ChecksumWriter::new(BufWriter::new(file)))?;
        cipher.write_all(content)?;
        let (buffered, checksum) = cipher.finish()?.finish()?;
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(checksum)
    }

    /// Checks and opens a payload written by [`ArchiveCodec::write_sealed_payload`].
    pub fn read_sealed_payload(&self, part: &ArchivePart) -> Result<Vec<u8>> {
        part.check()?;
        let mut reader = self.crypto.open(BufReader::new(File::open(&part.path)?))?;
        let mut content = Vec::new();
        reader.read_to_end(&mut content)?;
        Ok(content)
    }
}

fn archive_file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Writes a plain payload file (rules, icon) and returns its checksum.
pub fn write_payload(dir: &Path, file_name: &str, content: &[u8]) -> Result<String> {
    let file = File::create(dir.join(file_name))?;
    let mut writer = ChecksumWriter::new(BufWriter::new(file));
    writer.write_all(content)?;
    let (buffered, checksum) = writer.finish()?;
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(checksum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::calculate_checksum;
    use crate::crypto::{ArchiveKey, CipherWriter, CryptoMode, StaticKeyProvider};
    use tempfile::TempDir;

    fn create_test_directory() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path();

        fs::create_dir_all(base.join("files/nested")).unwrap();
        fs::create_dir_all(base.join("shared_prefs")).unwrap();
        fs::write(base.join("files/nested/note.txt"), "note").unwrap();
        fs::write(base.join("shared_prefs/prefs.xml"), "<map/>").unwrap();

        fs::create_dir_all(base.join("cache")).unwrap();
        fs::write(base.join("cache/blob.bin"), "cache").unwrap();
        fs::create_dir_all(base.join("code_cache")).unwrap();

        temp_dir
    }

    fn gzip_codec() -> ArchiveCodec {
        ArchiveCodec::new(ArchiveConfig::new(ArchiveFormat::Gzip).unwrap(), CryptoCodec::none())
    }

    #[test]
    fn test_pack_and_unpack_directory() {
        let source = create_test_directory();
        let out = TempDir::new().unwrap();
        let codec = gzip_codec();

        let packed = codec.pack_directory(source.path(), out.path(), "data0").unwrap();
        assert_eq!(packed.file_name, "data0.tar.gz");
        assert_eq!(packed.checksum, calculate_checksum(&out.path().join("data0.tar.gz")).unwrap());
        assert!(packed.entries > 0);

        let dest = TempDir::new().unwrap();
        let count = codec.unpack(&[packed.part(out.path())], dest.path()).unwrap();
        assert_eq!(count, packed.entries);
        assert_eq!(
            fs::read_to_string(dest.path().join("files/nested/note.txt")).unwrap(),
            "note"
        );
    }

    #[test]
    fn test_cache_excluded() {
        let source = create_test_directory();
        let out = TempDir::new().unwrap();
        let config = ArchiveConfig::new(ArchiveFormat::Zstd)
            .unwrap()
            .with_exclusions(ExclusionConfig::new(true, &[]).unwrap());
        let codec = ArchiveCodec::new(config, CryptoCodec::none());

        let packed = codec.pack_directory(source.path(), out.path(), "data0").unwrap();
        assert_eq!(packed.file_name, "data0.tar.zst");

        let dest = TempDir::new().unwrap();
        codec.unpack(&[packed.part(out.path())], dest.path()).unwrap();
        assert!(!dest.path().join("cache").exists());
        assert!(!dest.path().join("code_cache").exists());
        assert!(dest.path().join("shared_prefs/prefs.xml").is_file());
    }

    #[test]
    fn test_missing_source_yields_empty_archive() {
        let out = TempDir::new().unwrap();
        let codec = gzip_codec();
        let packed = codec
            .pack_directory(&out.path().join("absent"), out.path(), "data1")
            .unwrap();
        assert_eq!(packed.entries, 0);
        assert!(out.path().join("data1.tar.gz").is_file());
        assert_eq!(codec.verify(&[packed.part(out.path())]).unwrap(), 0);
    }

    #[test]
    fn test_only_extension() {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("base.apk"), "apk").unwrap();
        fs::write(source.path().join("split_config.en.apk"), "apk").unwrap();
        fs::create_dir_all(source.path().join("lib/arm64")).unwrap();
        fs::write(source.path().join("lib/arm64/libx.so"), "so").unwrap();

        let out = TempDir::new().unwrap();
        let config = ArchiveConfig::new(ArchiveFormat::Gzip)
            .unwrap()
            .with_only_extension("apk");
        let codec = ArchiveCodec::new(config, CryptoCodec::none());
        let packed = codec.pack_directory(source.path(), out.path(), "source").unwrap();
        assert_eq!(packed.entries, 2);
    }

    #[test]
    fn test_checksum_mismatch_detected() {
        let source = create_test_directory();
        let out = TempDir::new().unwrap();
        let codec = gzip_codec();
        let packed = codec.pack_directory(source.path(), out.path(), "data0").unwrap();

        let part = ArchivePart::new(out.path().join(&packed.file_name), "0".repeat(64));
        let dest = TempDir::new().unwrap();
        let err = codec.unpack(&[part], &dest.path().join("out")).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        // Nothing is written when the stored bytes do not match
        assert!(!dest.path().join("out").exists());
    }

    fn ecc_crypto(key: ArchiveKey) -> CryptoCodec {
        let provider = StaticKeyProvider::new().with_key(key);
        CryptoCodec::for_mode(CryptoMode::Ecc, Some(&provider)).unwrap()
    }

    #[test]
    fn test_encrypted_archive() {
        let source = create_test_directory();
        let out = TempDir::new().unwrap();
        let crypto = ecc_crypto(ArchiveKey::generate_identity());
        let codec = ArchiveCodec::new(ArchiveConfig::new(ArchiveFormat::Gzip).unwrap(), crypto);

        let packed = codec.pack_directory(source.path(), out.path(), "data0").unwrap();
        assert_eq!(packed.file_name, "data0.tar.gz.ecc");

        let dest = TempDir::new().unwrap();
        codec.unpack(&[packed.part(out.path())], dest.path()).unwrap();
        assert!(dest.path().join("files/nested/note.txt").is_file());

        let wrong = ArchiveCodec::new(
            ArchiveConfig::new(ArchiveFormat::Gzip).unwrap(),
            ecc_crypto(ArchiveKey::generate_identity()),
        );
        assert!(wrong.verify(&[packed.part(out.path())]).is_err());
    }

    /// Writes a tar.gz of `source` cut into `count` parts, each sealed by `crypto`.
    fn write_split(source: &Path, out: &Path, crypto: &CryptoCodec, count: usize) -> Vec<ArchivePart> {
        let mut tar = TarBuilder::new(Compressor::new(ArchiveFormat::Gzip, Vec::new(), 6).unwrap());
        tar.append_dir_all(".", source).unwrap();
        let stream = tar.into_inner().unwrap().finish().unwrap();

        let chunk = stream.len() / count + 1;
        stream
            .chunks(chunk)
            .enumerate()
            .map(|(index, bytes)| {
                let name = format!("data0.tar.gz.{}{}", index, crypto.mode().extension());
                let mut writer: CipherWriter<Vec<u8>> = crypto.seal(Vec::new()).unwrap();
                writer.write_all(bytes).unwrap();
                let sealed = writer.finish().unwrap();
                fs::write(out.join(&name), sealed).unwrap();
                ArchivePart::new(out.join(&name), calculate_checksum(&out.join(&name)).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_unpack_split_parts() {
        let source = create_test_directory();
        let out = TempDir::new().unwrap();
        let parts = write_split(source.path(), out.path(), &CryptoCodec::none(), 3);
        assert_eq!(parts.len(), 3);

        let dest = TempDir::new().unwrap();
        gzip_codec().unpack(&parts, dest.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dest.path().join("files/nested/note.txt")).unwrap(),
            "note"
        );
    }

    #[test]
    fn test_unpack_split_parts_sealed_individually() {
        let source = create_test_directory();
        let out = TempDir::new().unwrap();
        let crypto = ecc_crypto(ArchiveKey::generate_identity());
        let parts = write_split(source.path(), out.path(), &crypto, 2);

        let codec = ArchiveCodec::new(ArchiveConfig::new(ArchiveFormat::Gzip).unwrap(), crypto);
        let dest = TempDir::new().unwrap();
        codec.unpack(&parts, dest.path()).unwrap();
        assert!(dest.path().join("shared_prefs/prefs.xml").is_file());

        // A missing tail part leaves the stream short
        assert!(codec.verify(&parts[..1]).is_err());
    }

    #[test]
    fn test_sealed_payload_round_trip() {
        let out = TempDir::new().unwrap();
        let codec = ArchiveCodec::new(
            ArchiveConfig::new(ArchiveFormat::Gzip).unwrap(),
            ecc_crypto(ArchiveKey::generate_identity()),
        );
        let content = b"sample.app\tPERMISSION\tandroid.permission.CAMERA\ttrue\n";

        let checksum = codec.write_sealed_payload(out.path(), "misc.am.tsv.ecc", content).unwrap();
        let part = ArchivePart::new(out.path().join("misc.am.tsv.ecc"), checksum);
        assert_ne!(fs::read(&part.path).unwrap(), content.to_vec());
        assert_eq!(codec.read_sealed_payload(&part).unwrap(), content.to_vec());

        let stale = ArchivePart::new(part.path.clone(), "00".repeat(32));
        assert!(matches!(
            codec.read_sealed_payload(&stale),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_damaged_part_reported_by_name() {
        let source = create_test_directory();
        let out = TempDir::new().unwrap();
        let parts = write_split(source.path(), out.path(), &CryptoCodec::none(), 2);
        fs::write(&parts[1].path, b"garbage").unwrap();

        match gzip_codec().verify(&parts).unwrap_err() {
            Error::ChecksumMismatch { file, .. } => assert_eq!(file, "data0.tar.gz.1"),
            other => panic!("Expected checksum mismatch, got {}", other),
        }
    }

    #[test]
    fn test_pack_files_under_entry_names() {
        let source = TempDir::new().unwrap();
        let key = source.path().join("10123_USRPKEY_a");
        fs::write(&key, "secret").unwrap();

        let out = TempDir::new().unwrap();
        let codec = gzip_codec();
        let name = "data/misc/keystore/user_0/10123_USRPKEY_a".to_string();
        let packed = codec
            .pack_files(&[(key, name.clone())], out.path(), "keystore")
            .unwrap();
        assert_eq!(packed.entries, 1);

        let dest = TempDir::new().unwrap();
        codec.unpack(&[packed.part(out.path())], dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join(&name)).unwrap(), b"secret");
    }

    #[test]
    fn test_write_payload_checksum() {
        let out = TempDir::new().unwrap();
        let checksum = write_payload(out.path(), "rules.am.tsv", b"rules").unwrap();
        assert_eq!(checksum, calculate_checksum(&out.path().join("rules.am.tsv")).unwrap());
    }

    #[test]
    fn test_archive_config_compression_clamping() {
        let config = ArchiveConfig::new(ArchiveFormat::Gzip)
            .unwrap()
            .with_compression_level(15);
        assert_eq!(config.compression_level, 9);
    }
}
