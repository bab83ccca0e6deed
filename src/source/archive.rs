//! Extraction of downloaded source archives.

use std::{fs::File, io::Read, path::Path};

use flate2::read::GzDecoder;
use xz2::{read::XzDecoder, stream::Stream};

use crate::{Error, Result};

/// Compression stage in front of the tar stream, sniffed from the file name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArchiveKind {
    /// Plain `.tar`.
    Tar,
    /// `.tar.gz` or `.tgz`.
    TarGz,
    /// `.tar.xz` or `.txz`.
    TarXz,
    /// Legacy `.tar.lzma` or `.tlz`.
    TarLzma,
}

impl ArchiveKind {
    /// Picks the archive kind from the extension of `path`.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        [
            (".tar.gz", Self::TarGz),
            (".tgz", Self::TarGz),
            (".tar.xz", Self::TarXz),
            (".txz", Self::TarXz),
            (".tar.lzma", Self::TarLzma),
            (".tlz", Self::TarLzma),
            (".tar", Self::Tar),
        ]
        .into_iter()
        .find_map(|(suffix, kind)| name.ends_with(suffix).then_some(kind))
    }
}

/// Unpacks the archive at `file` into `destination`, choosing the decompression stage by extension.
///
/// This is blocking, callers on the async runtime should wrap it in `spawn_blocking`.
pub fn extract(file: &Path, destination: &Path) -> Result<()> {
    let kind = ArchiveKind::from_path(file)
        .ok_or_else(|| Error::Fetch(format!("unsupported archive format: {}", file.display())))?;
    log::debug!("extracting {} ({kind:?})...", file.display());

    let raw = File::open(file)?;
    let reader: Box<dyn Read> = match kind {
        ArchiveKind::Tar => Box::new(raw),
        ArchiveKind::TarGz => Box::new(GzDecoder::new(raw)),
        ArchiveKind::TarXz => Box::new(XzDecoder::new(raw)),
        ArchiveKind::TarLzma => {
            let stream = Stream::new_lzma_decoder(u64::MAX)
                .map_err(|err| Error::Fetch(format!("could not create lzma decoder: {err}")))?;
            Box::new(XzDecoder::new_stream(raw, stream))
        }
    };

    tar::Archive::new(reader)
        .unpack(destination)
        .map_err(|err| Error::Fetch(format!("could not extract {}: {err}", file.display())))
}

#[cfg(test)]
mod tests {
    use std::{fs, io::Write, path::PathBuf};

    use flate2::{write::GzEncoder, Compression};
    use xz2::{stream::LzmaOptions, write::XzEncoder};

    use super::*;

    fn tarball() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let content = b"print('hello')\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "engine-abc123/main.js", &content[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn sniffs_extensions() {
        let kind = |name: &str| ArchiveKind::from_path(&PathBuf::from(name));
        assert_eq!(kind("a.tar"), Some(ArchiveKind::Tar));
        assert_eq!(kind("a.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(kind("A.TGZ"), Some(ArchiveKind::TarGz));
        assert_eq!(kind("a.tar.xz"), Some(ArchiveKind::TarXz));
        assert_eq!(kind("a.tar.lzma"), Some(ArchiveKind::TarLzma));
        assert_eq!(kind("a.zip"), None);
    }

    #[test]
    fn extracts_every_supported_kind() {
        let dir = tempfile::tempdir().unwrap();
        let raw = tarball();

        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&raw).unwrap();
        let mut xz = XzEncoder::new(Vec::new(), 6);
        xz.write_all(&raw).unwrap();
        let lzma_alone = Stream::new_lzma_encoder(&LzmaOptions::new_preset(6).unwrap()).unwrap();
        let mut lzma = XzEncoder::new_stream(Vec::new(), lzma_alone);
        lzma.write_all(&raw).unwrap();

        for (name, data) in [
            ("src.tar", raw.clone()),
            ("src.tar.gz", gz.finish().unwrap()),
            ("src.tar.xz", xz.finish().unwrap()),
            ("src.tar.lzma", lzma.finish().unwrap()),
        ] {
            let file = dir.path().join(name);
            fs::write(&file, data).unwrap();
            let out = dir.path().join(format!("{name}.out"));
            fs::create_dir(&out).unwrap();
            extract(&file, &out).unwrap();
            assert_eq!(
                fs::read_to_string(out.join("engine-abc123/main.js")).unwrap(),
                "print('hello')\n"
            );
        }
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("src.zip");
        fs::write(&file, b"PK").unwrap();
        assert!(matches!(extract(&file, dir.path()), Err(Error::Fetch(_))));
    }
}
