//! Office documents → PDF through a headless LibreOffice.
//!
//! Each invocation gets its own [`tempfile::TempDir`] holding the input, the
//! output directory and a throwaway user profile. LibreOffice refuses to run
//! two instances on one profile, so a shared profile would serialise every
//! worker on the host; with a private one, conversions run in parallel and
//! leave nothing behind.

use super::{
    number_pages, rasterize_blocking, ConvertOptions, ExportProfile, ExportTarget, OfficeConverter,
    Rasterizer, RenderedPage,
};
use crate::error::RelayError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const TOOL: &str = "LibreOffice";
const BINARY_CANDIDATES: [&str; 2] = ["libreoffice", "soffice"];

const WRITER_PDF_FILTER: &str = "pdf:writer_pdf_Export:EmbedStandardFonts=true;UseTaggedPDF=false;\
UseLosslessCompression=true;ExportNotes=false;SkipEmptyPages=false;ExportBookmarks=false;SelectPdfVersion=1";
const CALC_PDF_FILTER: &str =
    "pdf:calc_pdf_Export:UseLosslessCompression=true;SelectPdfVersion=1;FitToPages=true";
const XLSX_FILTER: &str = "xlsx:Calc MS Excel 2007 XML";

impl ExportTarget {
    fn convert_arg(self) -> &'static str {
        match self {
            ExportTarget::Pdf(ExportProfile::Writer) => WRITER_PDF_FILTER,
            ExportTarget::Pdf(ExportProfile::Calc) => CALC_PDF_FILTER,
            ExportTarget::Xlsx => XLSX_FILTER,
        }
    }

    fn output_suffix(self) -> &'static str {
        match self {
            ExportTarget::Pdf(_) => "pdf",
            ExportTarget::Xlsx => "xlsx",
        }
    }
}

/// [`OfficeConverter`] that shells out to `libreoffice --headless`.
#[derive(Debug, Clone)]
pub struct LibreOfficeConverter {
    binary: PathBuf,
    timeout: Duration,
}

impl LibreOfficeConverter {
    /// Use `configured` if given, else the first of `libreoffice`/`soffice` on `PATH`.
    pub fn locate(configured: Option<&Path>, timeout: Duration) -> Result<Self, RelayError> {
        let binary = match configured {
            Some(path) if path.is_file() => path.to_path_buf(),
            Some(path) => {
                return Err(RelayError::ToolMissing {
                    tool: TOOL.into(),
                    detail: format!("{} does not exist", path.display()),
                    hint: "OFFICE_BINARY".into(),
                })
            }
            None => find_on_path(&BINARY_CANDIDATES).ok_or_else(|| RelayError::ToolMissing {
                tool: TOOL.into(),
                detail: "neither libreoffice nor soffice is on PATH".into(),
                hint: "OFFICE_BINARY".into(),
            })?,
        };
        info!(binary = %binary.display(), "Using LibreOffice");
        Ok(Self { binary, timeout })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

fn find_on_path(candidates: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| candidates.iter().map(move |c| dir.join(c)))
        .find(|p| p.is_file())
}

#[async_trait]
impl OfficeConverter for LibreOfficeConverter {
    async fn convert(
        &self,
        bytes: &[u8],
        suffix: &str,
        target: ExportTarget,
    ) -> Result<Vec<u8>, RelayError> {
        let workdir = tempfile::Builder::new()
            .prefix("relay-office-")
            .tempdir()
            .map_err(|e| RelayError::Internal(format!("Cannot create work dir: {e}")))?;
        let profile = workdir.path().join("lo_profile");
        let outdir = workdir.path().join("out");
        for dir in [&profile, &outdir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| RelayError::Internal(format!("Cannot create {}: {e}", dir.display())))?;
        }

        let source = workdir.path().join(format!("source.{suffix}"));
        tokio::fs::write(&source, bytes)
            .await
            .map_err(|e| RelayError::Internal(format!("Cannot stage document: {e}")))?;

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg(format!("-env:UserInstallation=file://{}", profile.display()))
            .args([
                "--headless",
                "--nologo",
                "--nodefault",
                "--nofirststartwizard",
                "--norestore",
                "--nolockcheck",
                "--convert-to",
                target.convert_arg(),
            ])
            .arg(&source)
            .arg("--outdir")
            .arg(&outdir)
            .current_dir(workdir.path())
            .env("HOME", &profile)
            .env("TMPDIR", workdir.path())
            .env("SAL_USE_VCLPLUGIN", "headless")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(suffix, target = target.output_suffix(), bytes = bytes.len(), "Running LibreOffice");
        let child = cmd.spawn().map_err(|e| RelayError::ToolMissing {
            tool: TOOL.into(),
            detail: format!("cannot start {}: {e}", self.binary.display()),
            hint: "OFFICE_BINARY".into(),
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| RelayError::Internal(format!("LibreOffice I/O: {e}")))?,
            Err(_) => {
                warn!(secs = self.timeout.as_secs(), "LibreOffice timed out");
                return Err(RelayError::ConversionTimeout {
                    tool: TOOL.into(),
                    secs: self.timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RelayError::ConversionRejected {
                tool: TOOL.into(),
                detail: format!("exit status {}: {}", output.status, stderr.trim()),
            });
        }

        let produced = locate_output(&outdir, target.output_suffix()).await?;
        let data = tokio::fs::read(&produced)
            .await
            .map_err(|e| RelayError::Internal(format!("Cannot read {}: {e}", produced.display())))?;
        debug!(bytes = data.len(), "LibreOffice finished");
        Ok(data)
    }
}

/// `source.<suffix>` if present, else the first file with that suffix.
async fn locate_output(outdir: &Path, suffix: &str) -> Result<PathBuf, RelayError> {
    let expected = outdir.join(format!("source.{suffix}"));
    if tokio::fs::try_exists(&expected).await.unwrap_or(false) {
        return Ok(expected);
    }
    let mut candidates = Vec::new();
    let mut entries = tokio::fs::read_dir(outdir)
        .await
        .map_err(|e| RelayError::Internal(format!("Cannot list {}: {e}", outdir.display())))?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some(suffix) {
            candidates.push(path);
        }
    }
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| RelayError::ConversionRejected {
            tool: TOOL.into(),
            detail: format!("no .{suffix} file was produced"),
        })
}

/// DOC/DOCX: convert to PDF with the writer profile, then rasterise every page.
pub async fn convert_document(
    office: &dyn OfficeConverter,
    rasterizer: Arc<dyn Rasterizer>,
    bytes: &[u8],
    suffix: &str,
    opts: &ConvertOptions,
) -> Result<Vec<RenderedPage>, RelayError> {
    let pdf = office
        .convert(bytes, suffix, ExportTarget::Pdf(ExportProfile::Writer))
        .await?;
    let pngs = rasterize_blocking(rasterizer, pdf, opts.dpi, opts.max_rendered_pixels, None).await?;
    Ok(number_pages(pngs, opts))
}
