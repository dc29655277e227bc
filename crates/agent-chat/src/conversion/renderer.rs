//! Renderer backed by the `soffice` and `pdftoppm` command-line tools.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ConversionError, DocumentKind, DocumentRenderer, ImageCompressor, PageImage};
use crate::config::ConversionSettings;

const STDERR_LIMIT: usize = 500;

pub struct CliRenderer {
    soffice: Option<PathBuf>,
    pdftoppm: Option<PathBuf>,
    soffice_name: String,
    pdftoppm_name: String,
    timeout: Duration,
    dpi: u32,
    compressor: ImageCompressor,
}

impl CliRenderer {
    /// Resolves both binaries once. A missing binary is not fatal; jobs
    /// that need it fail with [`ConversionError::ToolMissing`].
    pub fn new(settings: &ConversionSettings) -> Self {
        let soffice = resolve("LibreOffice", &settings.libreoffice_path);
        let pdftoppm = resolve("pdftoppm", &settings.pdftoppm_path);
        Self {
            soffice,
            pdftoppm,
            soffice_name: settings.libreoffice_path.clone(),
            pdftoppm_name: settings.pdftoppm_path.clone(),
            timeout: Duration::from_secs(settings.libreoffice_timeout_seconds.max(1)),
            dpi: settings.pdf_dpi,
            compressor: ImageCompressor::new(settings.image_quality, settings.image_max_dimension),
        }
    }

    async fn office_to_pdf(&self, kind: DocumentKind, data: &[u8], workdir: &Path) -> Result<PathBuf, ConversionError> {
        let soffice = self
            .soffice
            .as_ref()
            .ok_or_else(|| ConversionError::ToolMissing(self.soffice_name.clone()))?;
        let extension = kind
            .office_extension()
            .ok_or_else(|| ConversionError::UnsupportedType(kind.to_string()))?;

        let input = workdir.join(format!("input.{}", extension));
        tokio::fs::write(&input, data).await?;

        let mut command = Command::new(soffice);
        command
            .arg("--headless")
            .arg("--nofirststartwizard")
            .arg("--norestore")
            .arg("--nolockcheck")
            .arg(format!("-env:UserInstallation=file://{}", workdir.join("profile").display()))
            .arg("--convert-to")
            .arg("pdf")
            .arg("--outdir")
            .arg(workdir)
            .arg(&input)
            .env("HOME", workdir);
        self.run_tool("LibreOffice", command).await?;

        let pdf = workdir.join("input.pdf");
        if !tokio::fs::try_exists(&pdf).await? {
            return Err(ConversionError::ToolFailed {
                tool: "LibreOffice".to_string(),
                stderr: "no PDF was produced".to_string(),
            });
        }
        Ok(pdf)
    }

    async fn rasterize_pdf(&self, pdf: &Path, workdir: &Path) -> Result<Vec<PageImage>, ConversionError> {
        let pdftoppm = self
            .pdftoppm
            .as_ref()
            .ok_or_else(|| ConversionError::ToolMissing(self.pdftoppm_name.clone()))?;

        let prefix = workdir.join("page");
        let mut command = Command::new(pdftoppm);
        command
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg("-png")
            .arg(pdf)
            .arg(&prefix);
        self.run_tool("pdftoppm", command).await?;

        let mut rendered = Vec::new();
        let mut entries = tokio::fs::read_dir(workdir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(page) = page_number(&name) {
                rendered.push((page, entry.path()));
            }
        }
        rendered.sort_by_key(|(page, _)| *page);
        debug!(pages = rendered.len(), "Rasterized PDF");

        let mut pages = Vec::with_capacity(rendered.len());
        for (page, path) in rendered {
            let bytes = tokio::fs::read(&path).await?;
            pages.push(self.compressor.compress(&bytes, page)?);
        }
        Ok(pages)
    }

    async fn run_tool(&self, tool: &str, mut command: Command) -> Result<(), ConversionError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConversionError::ToolMissing(tool.to_string()),
            _ => ConversionError::Io(e),
        })?;

        // Dropping the child on timeout kills it.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ConversionError::Timeout {
                tool: tool.to_string(),
                seconds: self.timeout.as_secs(),
            })??;

        if output.status.success() {
            Ok(())
        } else {
            let stderr: String = String::from_utf8_lossy(&output.stderr)
                .trim()
                .chars()
                .take(STDERR_LIMIT)
                .collect();
            Err(ConversionError::ToolFailed {
                tool: tool.to_string(),
                stderr: if stderr.is_empty() { format!("exit status {}", output.status) } else { stderr },
            })
        }
    }
}

#[async_trait]
impl DocumentRenderer for CliRenderer {
    async fn render(
        &self,
        kind: DocumentKind,
        data: &[u8],
        client_pages: &[Vec<u8>],
    ) -> Result<Vec<PageImage>, ConversionError> {
        match kind {
            DocumentKind::Image => Ok(vec![self.compressor.compress(data, 1)?]),
            DocumentKind::Pdf if !client_pages.is_empty() => client_pages
                .iter()
                .enumerate()
                .map(|(i, page)| self.compressor.compress(page, i as i64 + 1))
                .collect(),
            DocumentKind::Pdf => {
                let workdir = TempDir::new()?;
                let pdf = workdir.path().join("input.pdf");
                tokio::fs::write(&pdf, data).await?;
                self.rasterize_pdf(&pdf, workdir.path()).await
            }
            DocumentKind::Docx | DocumentKind::Ppt => {
                let workdir = TempDir::new()?;
                let pdf = self.office_to_pdf(kind, data, workdir.path()).await?;
                self.rasterize_pdf(&pdf, workdir.path()).await
            }
        }
    }
}

fn resolve(label: &str, configured: &str) -> Option<PathBuf> {
    match which::which(configured) {
        Ok(path) => {
            info!("{} found at {}", label, path.display());
            Some(path)
        }
        Err(_) => {
            warn!("{} not found ({}); conversions that need it will fail", label, configured);
            None
        }
    }
}

/// Page number of a `pdftoppm` output file such as `page-03.png`.
fn page_number(file_name: &str) -> Option<i64> {
    file_name
        .strip_prefix("page-")?
        .strip_suffix(".png")?
        .parse()
        .ok()
}
