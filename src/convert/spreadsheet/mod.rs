//! Spreadsheets → one page per detected table region.
//!
//! A worksheet is not a page: printing it whole yields either a postage
//! stamp or a dozen tiles cut through the middle of a table. Instead each
//! data-dense rectangle found by [`detect::detect_regions`] is exported on
//! its own, fitted to a single page.
//!
//! Non-XLSX inputs (XLS, ODS) are first normalised to XLSX by the office
//! stage, so detection and export always work on one package format.

pub mod detect;
pub mod package;

use super::{
    page_filename, rasterize_blocking, ConvertOptions, ExportProfile, ExportTarget,
    OfficeConverter, PageExtra, Rasterizer, RenderedPage,
};
use crate::error::RelayError;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use detect::{detect_regions, SheetOccupancy, TableRegion};
use package::{SheetEntry, XlsxPackage};
use serde::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Suffixes already in Office Open XML form.
const XLSX_SUFFIXES: [&str; 2] = ["xlsx", "xlsm"];

/// Detected tables of one worksheet.
#[derive(Debug, Clone, Serialize)]
pub struct SheetTables {
    pub sheet_index: usize,
    pub sheet_name: String,
    pub regions: Vec<TableRegion>,
    #[serde(skip)]
    entry: SheetEntry,
}

/// A parsed workbook with its table regions.
#[derive(Debug, Clone)]
pub struct WorkbookAnalysis {
    package: XlsxPackage,
    pub sheets: Vec<SheetTables>,
}

impl WorkbookAnalysis {
    pub fn regions_total(&self) -> usize {
        self.sheets.iter().map(|s| s.regions.len()).sum()
    }
}

/// Spreadsheet conversion result.
#[derive(Debug, Clone)]
pub struct SpreadsheetRender {
    pub pages: Vec<RenderedPage>,
    pub sheets_total: usize,
}

fn is_blank(cell: &Data) -> bool {
    match cell {
        Data::Empty => true,
        Data::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Parse an XLSX workbook and detect the table regions of every sheet.
///
/// Blocking; run it under `spawn_blocking`.
pub fn analyze(xlsx: &[u8]) -> Result<WorkbookAnalysis, RelayError> {
    let package = XlsxPackage::read(xlsx)?;
    let mut workbook =
        open_workbook_auto_from_rs(Cursor::new(xlsx.to_vec())).map_err(|e| {
            RelayError::CorruptDocument {
                format: "xlsx".into(),
                detail: e.to_string(),
            }
        })?;

    let mut sheets = Vec::new();
    for entry in package.sheets()? {
        let mut occ = SheetOccupancy::new();
        match workbook.worksheet_range(&entry.name) {
            Ok(range) => {
                if let Some((row0, col0)) = range.start() {
                    for (r, c, cell) in range.used_cells() {
                        if !is_blank(cell) {
                            occ.add_value(row0 + r as u32 + 1, col0 + c as u32 + 1);
                        }
                    }
                }
            }
            Err(e) => debug!(sheet = %entry.name, error = %e, "Not a worksheet; skipping cells"),
        }
        for (row, col) in package.image_anchors(&entry)? {
            occ.add_anchor(row, col);
        }

        let regions = detect_regions(&occ, entry.index);
        debug!(sheet = %entry.name, tables = regions.len(), "Detected tables");
        sheets.push(SheetTables {
            sheet_index: entry.index,
            sheet_name: entry.name.clone(),
            regions,
            entry,
        });
    }
    Ok(WorkbookAnalysis { package, sheets })
}

/// Bring any spreadsheet into XLSX form.
pub async fn normalize(
    office: &dyn OfficeConverter,
    bytes: Vec<u8>,
    suffix: &str,
) -> Result<Vec<u8>, RelayError> {
    if XLSX_SUFFIXES.contains(&suffix) {
        return Ok(bytes);
    }
    info!(suffix, "Normalising spreadsheet to XLSX");
    office.convert(&bytes, suffix, ExportTarget::Xlsx).await
}

/// Render every table region of a spreadsheet as its own page.
pub async fn convert(
    office: &dyn OfficeConverter,
    rasterizer: Arc<dyn Rasterizer>,
    bytes: Vec<u8>,
    suffix: &str,
    opts: &ConvertOptions,
) -> Result<SpreadsheetRender, RelayError> {
    let xlsx = normalize(office, bytes, suffix).await?;
    let analysis = tokio::task::spawn_blocking(move || analyze(&xlsx))
        .await
        .map_err(|e| RelayError::Internal(format!("Workbook analysis panicked: {e}")))??;

    let total = analysis.regions_total();
    info!(
        sheets = analysis.sheets.len(),
        tables = total,
        "Workbook analysed"
    );

    let mut pages = Vec::with_capacity(total);
    for sheet in &analysis.sheets {
        for (t, region) in sheet.regions.iter().enumerate() {
            let isolated = analysis.package.isolate_region(&sheet.entry, region)?;
            let pdf = office
                .convert(&isolated, "xlsx", ExportTarget::Pdf(ExportProfile::Calc))
                .await?;
            let png = rasterize_blocking(
                rasterizer.clone(),
                pdf,
                opts.dpi,
                opts.max_rendered_pixels,
                Some(1),
            )
            .await?
            .into_iter()
            .next();

            let Some(png) = png else {
                warn!(sheet = %sheet.sheet_name, range = %region.a1_range(), "Region exported to an empty PDF");
                continue;
            };
            let index = pages.len();
            pages.push(RenderedPage {
                filename: page_filename(&opts.base_name, index, total, opts.index_width),
                png,
                page_index: index + 1,
                pages_total: total,
                extra: PageExtra {
                    sheet_name: Some(sheet.sheet_name.clone()),
                    table_range: Some(region.a1_range()),
                    table_index: Some(t + 1),
                    sheet_index: Some(sheet.sheet_index),
                    tables_in_sheet: Some(sheet.regions.len()),
                },
            });
        }
    }

    // Renumber if a region produced nothing, so totals match what was rendered.
    if pages.len() != total {
        let rendered = pages.len();
        for (i, page) in pages.iter_mut().enumerate() {
            page.filename = page_filename(&opts.base_name, i, rendered, opts.index_width);
            page.page_index = i + 1;
            page.pages_total = rendered;
        }
    }

    Ok(SpreadsheetRender {
        pages,
        sheets_total: analysis.sheets.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Hands back the isolated workbook as the "PDF" and records every call.
    #[derive(Default)]
    struct EchoOffice {
        calls: Mutex<Vec<(String, ExportTarget)>>,
    }

    #[async_trait]
    impl OfficeConverter for EchoOffice {
        async fn convert(
            &self,
            bytes: &[u8],
            suffix: &str,
            target: ExportTarget,
        ) -> Result<Vec<u8>, RelayError> {
            self.calls.lock().unwrap().push((suffix.to_string(), target));
            match target {
                ExportTarget::Xlsx => Ok(package::fixture::workbook()),
                ExportTarget::Pdf(_) => Ok(bytes.to_vec()),
            }
        }
    }

    /// One page whose bytes are the length of the input.
    struct LengthRasterizer;

    impl Rasterizer for LengthRasterizer {
        fn rasterize(
            &self,
            pdf: &[u8],
            _dpi: u32,
            _max_pixels: u32,
            limit: Option<usize>,
        ) -> Result<Vec<Vec<u8>>, RelayError> {
            assert_eq!(limit, Some(1));
            Ok(vec![pdf.len().to_le_bytes().to_vec()])
        }
    }

    #[test]
    fn analysis_finds_tables_and_picture_rows() {
        let analysis = analyze(&package::fixture::workbook()).unwrap();
        assert_eq!(analysis.sheets.len(), 2);

        let data = &analysis.sheets[0];
        assert_eq!(data.sheet_name, "Data");
        let ranges: Vec<_> = data.regions.iter().map(TableRegion::a1_range).collect();
        assert_eq!(ranges, ["A1:C5", "A12:E12"]);

        let notes = &analysis.sheets[1];
        assert_eq!(notes.regions.len(), 1);
        assert_eq!(notes.regions[0].a1_range(), "B2:C3");
        assert_eq!(analysis.regions_total(), 3);
    }

    #[tokio::test]
    async fn each_region_becomes_a_page() {
        let office = EchoOffice::default();
        let rendered = convert(
            &office,
            Arc::new(LengthRasterizer),
            package::fixture::workbook(),
            "xlsx",
            &ConvertOptions::new("budget", 300),
        )
        .await
        .unwrap();

        assert_eq!(rendered.sheets_total, 2);
        let names: Vec<_> = rendered.pages.iter().map(|p| p.filename.as_str()).collect();
        assert_eq!(names, ["budget-01.png", "budget-02.png", "budget-03.png"]);

        let first = &rendered.pages[0].extra;
        assert_eq!(first.sheet_name.as_deref(), Some("Data"));
        assert_eq!(first.table_range.as_deref(), Some("A1:C5"));
        assert_eq!(first.table_index, Some(1));
        assert_eq!(first.tables_in_sheet, Some(2));
        let last = &rendered.pages[2].extra;
        assert_eq!(last.sheet_index, Some(2));
        assert_eq!(last.table_index, Some(1));

        let calls = office.calls.lock().unwrap();
        assert_eq!(calls.len(), 3, "xlsx input needs no normalisation");
        assert!(calls
            .iter()
            .all(|(s, t)| s == "xlsx" && *t == ExportTarget::Pdf(ExportProfile::Calc)));
    }

    #[tokio::test]
    async fn legacy_formats_are_normalised_first() {
        let office = EchoOffice::default();
        convert(
            &office,
            Arc::new(LengthRasterizer),
            b"legacy xls bytes".to_vec(),
            "xls",
            &ConvertOptions::new("old", 300),
        )
        .await
        .unwrap();
        let calls = office.calls.lock().unwrap();
        assert_eq!(calls[0], ("xls".to_string(), ExportTarget::Xlsx));
    }
}
