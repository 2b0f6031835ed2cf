//! Acquisition of the base Windows disk image.
//!
//! The vendor ships a zip holding an OVA (a tar) holding a VMDK. We download
//! the zip, pull the VMDK out through both layers, convert it to qcow2 with
//! `qemu-img` and delete the intermediates.
//!
//! The whole stage is skipped when the converted image already exists; the
//! check is on the path only, never on content.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};
use xshell::{cmd, Shell};

use crate::config::{ImageSource, WorkerLayout};
use crate::errors::{ProvisionError, Result};
use crate::poll::CancelToken;

/// Stage an image artifact is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// The downloaded vendor zip.
    Archive,
    /// The VMDK extracted from the archive.
    RawDisk,
    /// The final qcow2 image.
    Converted,
}

/// A disk-image artifact on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseImage {
    pub path: Utf8PathBuf,
    pub format: ImageFormat,
}

/// The network and conversion side effects of acquisition.
pub trait ImageFetcher {
    fn download(&mut self, url: &str, dest: &Utf8Path) -> Result<()>;
    fn convert(&mut self, vmdk: &Utf8Path, qcow2: &Utf8Path) -> Result<()>;
}

const COPY_CHUNK: usize = 64 * 1024;

/// `io::copy` that checks `cancel` before every chunk.
fn copy_until_cancelled(
    reader: &mut impl Read,
    writer: &mut impl Write,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Fetches over HTTP(S) and converts with the host's `qemu-img`.
#[derive(Debug, Default)]
pub struct HttpFetcher {
    cancel: CancelToken,
}

impl HttpFetcher {
    pub fn new(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

impl ImageFetcher for HttpFetcher {
    fn download(&mut self, url: &str, dest: &Utf8Path) -> Result<()> {
        let err = |message: String| ProvisionError::Download {
            url: url.to_owned(),
            message,
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(None)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| err(e.to_string()))?;
        let resp = client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| err(e.to_string()))?;

        let pb = match resp.content_length() {
            Some(size) => {
                debug!("size={size}");
                let pb = ProgressBar::new(size);
                if let Ok(style) = ProgressStyle::with_template(
                    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes}",
                ) {
                    pb.set_style(style.progress_chars("#>-"));
                }
                pb
            }
            None => ProgressBar::new_spinner(),
        };
        let mut out = File::create(dest).map_err(|e| err(format!("creating {dest}: {e}")))?;
        let mut reader = pb.wrap_read(resp);
        let copied = copy_until_cancelled(&mut reader, &mut out, &self.cancel);
        pb.finish_and_clear();
        match copied {
            Ok(n) => debug!("Downloaded {n} bytes to {dest}"),
            Err(ProvisionError::Io(e)) => return Err(err(e.to_string())),
            Err(e) => return Err(e),
        }
        out.sync_all().map_err(|e| err(e.to_string()))?;
        Ok(())
    }

    fn convert(&mut self, vmdk: &Utf8Path, qcow2: &Utf8Path) -> Result<()> {
        let err = |message: String| ProvisionError::Conversion {
            source_disk: vmdk.as_std_path().to_path_buf(),
            message,
        };
        let sh = Shell::new().map_err(|e| err(e.to_string()))?;
        cmd!(sh, "qemu-img convert -O qcow2 {vmdk} {qcow2}")
            .run()
            .map_err(|e| err(e.to_string()))
    }
}

/// The named idempotence precondition for acquisition.
pub fn base_image_present(layout: &WorkerLayout) -> bool {
    layout.base_image().exists()
}

fn extraction_error(archive: &Utf8Path, member: &str, message: impl ToString) -> ProvisionError {
    ProvisionError::Extraction {
        archive: archive.as_std_path().to_path_buf(),
        member: member.to_owned(),
        message: message.to_string(),
    }
}

/// Copy the zip member `member` to `dest`.
fn extract_from_zip(archive: &Utf8Path, member: &str, dest: &Utf8Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| extraction_error(archive, member, e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| extraction_error(archive, member, e))?;
    let mut entry = zip
        .by_name(member)
        .map_err(|e| extraction_error(archive, member, e))?;
    let mut out = File::create(dest).map_err(|e| extraction_error(archive, member, e))?;
    io::copy(&mut entry, &mut out).map_err(|e| extraction_error(archive, member, e))?;
    Ok(())
}

/// Copy the tar member `member` to `dest`.
fn extract_from_tar(archive: &Utf8Path, member: &str, dest: &Utf8Path) -> Result<()> {
    let file = File::open(archive).map_err(|e| extraction_error(archive, member, e))?;
    let mut tar = tar::Archive::new(file);
    let entries = tar
        .entries()
        .map_err(|e| extraction_error(archive, member, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| extraction_error(archive, member, e))?;
        let path = entry
            .path()
            .map_err(|e| extraction_error(archive, member, e))?;
        if path.as_os_str() != member {
            continue;
        }
        let mut out = File::create(dest).map_err(|e| extraction_error(archive, member, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| extraction_error(archive, member, e))?;
        return Ok(());
    }
    Err(extraction_error(archive, member, "no such member"))
}

/// Delete intermediates; failures are logged and otherwise ignored.
fn remove_intermediates(paths: &[&Utf8Path]) {
    info!("Removing temporary files...");
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not delete {path}: {e}"),
        }
    }
}

/// Produce the converted base image, downloading it if necessary.
pub fn ensure_base_image(
    layout: &WorkerLayout,
    source: &ImageSource,
    fetcher: &mut dyn ImageFetcher,
) -> Result<BaseImage> {
    let base = BaseImage {
        path: layout.base_image(),
        format: ImageFormat::Converted,
    };
    if base_image_present(layout) {
        info!("Base image {} already present, skipping download.", base.path);
        return Ok(base);
    }

    info!("Creating workers directory...");
    fs::create_dir_all(layout.dir())?;

    let archive = BaseImage {
        path: layout.dir().join(source.archive_name()),
        format: ImageFormat::Archive,
    };
    let ova = layout.dir().join(&source.ova_name);
    let disk = BaseImage {
        path: layout.dir().join(&source.vmdk_name),
        format: ImageFormat::RawDisk,
    };
    let partial = layout.dir().join(format!("{}.partial", WorkerLayout::BASE_IMAGE));

    let r = (|| {
        info!("Downloading {}", source.url);
        fetcher.download(&source.url, &archive.path)?;

        info!("Extracting zipfile...");
        extract_from_zip(&archive.path, &source.ova_name, &ova)?;

        info!("Extracting tarfile...");
        extract_from_tar(&ova, &source.vmdk_name, &disk.path)?;

        info!("Converting vmdk disk to qcow2 image...");
        fetcher.convert(&disk.path, &partial)?;
        fs::rename(&partial, &base.path).map_err(|e| ProvisionError::Conversion {
            source_disk: disk.path.clone().into_std_path_buf(),
            message: e.to_string(),
        })
    })();

    remove_intermediates(&[&archive.path, &ova, &disk.path, &partial]);
    r.map(|()| base)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const DISK_BYTES: &[u8] = b"KDMV fake sparse extent";

    /// Serves a zip-of-tar fixture and "converts" by copying.
    #[derive(Debug, Default)]
    struct FixtureFetcher {
        downloads: u32,
        conversions: u32,
        fail_convert: bool,
    }

    fn write_fixture(dest: &Utf8Path) {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            for (name, data) in [("IE9 - Win7.ovf", &b"<Envelope/>"[..]), (DEFAULT_VMDK, DISK_BYTES)] {
                let mut header = tar::Header::new_gnu();
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, name, data).unwrap();
            }
            builder.finish().unwrap();
        }
        let mut zip = zip::ZipWriter::new(File::create(dest).unwrap());
        zip.start_file(DEFAULT_OVA, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(&tar_bytes).unwrap();
        zip.finish().unwrap();
    }

    const DEFAULT_OVA: &str = crate::config::DEFAULT_OVA_NAME;
    const DEFAULT_VMDK: &str = crate::config::DEFAULT_VMDK_NAME;

    impl ImageFetcher for FixtureFetcher {
        fn download(&mut self, _url: &str, dest: &Utf8Path) -> Result<()> {
            self.downloads += 1;
            write_fixture(dest);
            Ok(())
        }

        fn convert(&mut self, vmdk: &Utf8Path, qcow2: &Utf8Path) -> Result<()> {
            self.conversions += 1;
            if self.fail_convert {
                fs::write(qcow2, b"half").unwrap();
                return Err(ProvisionError::Conversion {
                    source_disk: vmdk.as_std_path().to_path_buf(),
                    message: "qemu-img exited with 1".into(),
                });
            }
            fs::copy(vmdk, qcow2).map(|_| ()).map_err(Into::into)
        }
    }

    fn tempdir_layout() -> (tempfile::TempDir, WorkerLayout) {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap().join("workers");
        (td, WorkerLayout::new(dir))
    }

    fn dir_entries(dir: &Utf8Path) -> Vec<String> {
        let mut r: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        r.sort();
        r
    }

    #[test]
    fn test_existing_image_skips_everything() {
        let (_td, layout) = tempdir_layout();
        fs::create_dir_all(layout.dir()).unwrap();
        fs::write(layout.base_image(), b"qcow2").unwrap();

        let mut fetcher = FixtureFetcher::default();
        let base = ensure_base_image(&layout, &ImageSource::default(), &mut fetcher).unwrap();
        assert_eq!(base.path, layout.base_image());
        assert_eq!(base.format, ImageFormat::Converted);
        assert_eq!((fetcher.downloads, fetcher.conversions), (0, 0));
        assert_eq!(dir_entries(layout.dir()), vec!["base.qcow2"]);
    }

    #[test]
    fn test_download_extract_convert() {
        let (_td, layout) = tempdir_layout();
        let mut fetcher = FixtureFetcher::default();
        let base = ensure_base_image(&layout, &ImageSource::default(), &mut fetcher).unwrap();
        assert_eq!((fetcher.downloads, fetcher.conversions), (1, 1));
        assert_eq!(fs::read(&base.path).unwrap(), DISK_BYTES);
        // Intermediates are gone.
        assert_eq!(dir_entries(layout.dir()), vec!["base.qcow2"]);

        // A second run is a no-op.
        ensure_base_image(&layout, &ImageSource::default(), &mut fetcher).unwrap();
        assert_eq!((fetcher.downloads, fetcher.conversions), (1, 1));
    }

    #[test]
    fn test_missing_member() {
        let (_td, layout) = tempdir_layout();
        let source = ImageSource {
            vmdk_name: "nope.vmdk".into(),
            ..Default::default()
        };
        let mut fetcher = FixtureFetcher::default();
        let r = ensure_base_image(&layout, &source, &mut fetcher);
        assert!(matches!(r, Err(ProvisionError::Extraction { .. })), "{r:?}");
        assert_eq!(fetcher.conversions, 0);
        assert!(!base_image_present(&layout));
    }

    /// Cancels its token once the first chunk has been handed out.
    struct CancellingReader {
        inner: io::Cursor<Vec<u8>>,
        cancel: CancelToken,
    }

    impl Read for CancellingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.cancel.cancel();
            Ok(n)
        }
    }

    #[test]
    fn test_copy_stops_when_cancelled() {
        let cancel = CancelToken::new();
        let mut reader = CancellingReader {
            inner: io::Cursor::new(vec![7u8; COPY_CHUNK * 4]),
            cancel: cancel.clone(),
        };
        let mut out = Vec::new();
        let r = copy_until_cancelled(&mut reader, &mut out, &cancel);
        assert!(matches!(r, Err(ProvisionError::Cancelled)), "{r:?}");
        assert_eq!(out.len(), COPY_CHUNK);

        let mut out = Vec::new();
        let r = copy_until_cancelled(&mut io::Cursor::new(b"abc".to_vec()), &mut out, &cancel);
        assert!(matches!(r, Err(ProvisionError::Cancelled)), "{r:?}");
        assert!(out.is_empty());
    }

    #[test]
    fn test_copy_until_cancelled_copies_everything() {
        let data: Vec<u8> = (0..COPY_CHUNK * 2 + 17).map(|i| i as u8).collect();
        let mut out = Vec::new();
        let n = copy_until_cancelled(&mut io::Cursor::new(data.clone()), &mut out, &CancelToken::new())
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn test_failed_conversion_leaves_no_base_image() {
        let (_td, layout) = tempdir_layout();
        let mut fetcher = FixtureFetcher {
            fail_convert: true,
            ..Default::default()
        };
        let r = ensure_base_image(&layout, &ImageSource::default(), &mut fetcher);
        assert!(matches!(r, Err(ProvisionError::Conversion { .. })));
        assert!(!base_image_present(&layout));
        assert!(dir_entries(layout.dir()).is_empty());
    }
}
