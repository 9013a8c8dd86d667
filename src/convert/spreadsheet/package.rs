//! Reading and rewriting Office Open XML workbook packages.
//!
//! Exporting one table region means handing the office suite a workbook in
//! which that region is the only printable thing. The package is rewritten
//! in place: every other sheet is hidden, the region becomes the sheet's
//! `_xlnm.Print_Area`, the page setup fits the area onto one page with the
//! orientation of the region, and the sheet is made active. Parts we do not
//! touch are copied byte-for-byte.

use super::detect::TableRegion;
use crate::error::RelayError;
use quick_xml::escape::{partial_escape, unescape};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use tracing::debug;

const PRINT_AREA: &str = "_xlnm.Print_Area";
const DEFAULT_WORKBOOK: &str = "xl/workbook.xml";

/// Top-level worksheet children that must follow `pageSetup`.
const AFTER_PAGE_SETUP: [&[u8]; 17] = [
    b"headerFooter",
    b"rowBreaks",
    b"colBreaks",
    b"customProperties",
    b"cellWatches",
    b"ignoredErrors",
    b"smartTags",
    b"drawing",
    b"legacyDrawing",
    b"legacyDrawingHF",
    b"drawingHF",
    b"picture",
    b"oleObjects",
    b"controls",
    b"webPublishItems",
    b"tableParts",
    b"extLst",
];

fn corrupt(detail: impl std::fmt::Display) -> RelayError {
    RelayError::CorruptDocument {
        format: "xlsx".into(),
        detail: detail.to_string(),
    }
}

/// One worksheet entry of the workbook, in tab order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetEntry {
    /// 1-based tab position.
    pub index: usize,
    pub name: String,
    /// Package path of the worksheet part, e.g. `xl/worksheets/sheet1.xml`.
    pub path: String,
}

/// An unpacked `.xlsx` package.
#[derive(Debug, Clone)]
pub struct XlsxPackage {
    entries: Vec<(String, Vec<u8>)>,
}

impl XlsxPackage {
    pub fn read(bytes: &[u8]) -> Result<Self, RelayError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(corrupt)?;
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).map_err(corrupt)?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let mut buf = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut buf).map_err(corrupt)?;
            entries.push((name, buf));
        }
        Ok(Self { entries })
    }

    fn part(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, data)| data.as_slice())
    }

    fn part_str(&self, name: &str) -> Result<&str, RelayError> {
        let data = self
            .part(name)
            .ok_or_else(|| corrupt(format!("missing part {name}")))?;
        std::str::from_utf8(data).map_err(|e| corrupt(format!("{name}: {e}")))
    }

    fn workbook_path(&self) -> String {
        self.part_str("_rels/.rels")
            .ok()
            .and_then(|xml| relationships(xml).ok())
            .and_then(|rels| {
                rels.into_iter()
                    .find(|r| r.kind.ends_with("/officeDocument"))
                    .map(|r| resolve_target("", &r.target))
            })
            .unwrap_or_else(|| DEFAULT_WORKBOOK.to_string())
    }

    /// Worksheets in tab order.
    pub fn sheets(&self) -> Result<Vec<SheetEntry>, RelayError> {
        let workbook = self.workbook_path();
        let rels = relationships(self.part_str(&rels_path_for(&workbook))?)?;
        let targets: HashMap<String, String> = rels
            .into_iter()
            .map(|r| (r.id, resolve_target(parent_dir(&workbook), &r.target)))
            .collect();

        let mut reader = Reader::from_str(self.part_str(&workbook)?);
        let mut sheets = Vec::new();
        loop {
            match reader.read_event().map_err(corrupt)? {
                Event::Eof => break,
                Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                    let name = attr(&e, b"name").unwrap_or_default();
                    let rel = attr(&e, b"id")
                        .ok_or_else(|| corrupt(format!("sheet '{name}' has no relationship id")))?;
                    let path = targets
                        .get(&rel)
                        .cloned()
                        .ok_or_else(|| corrupt(format!("sheet '{name}' points at unknown {rel}")))?;
                    sheets.push(SheetEntry {
                        index: sheets.len() + 1,
                        name,
                        path,
                    });
                }
                _ => {}
            }
        }
        Ok(sheets)
    }

    /// 1-based `(row, col)` anchor cells of the pictures drawn on `sheet`.
    pub fn image_anchors(&self, sheet: &SheetEntry) -> Result<Vec<(u32, u32)>, RelayError> {
        let Ok(rels_xml) = self.part_str(&rels_path_for(&sheet.path)) else {
            return Ok(Vec::new());
        };
        let mut anchors = Vec::new();
        for rel in relationships(rels_xml)? {
            if !rel.kind.ends_with("/drawing") {
                continue;
            }
            let drawing = resolve_target(parent_dir(&sheet.path), &rel.target);
            match self.part_str(&drawing) {
                Ok(xml) => anchors.extend(drawing_anchors(xml)?),
                Err(_) => debug!(part = %drawing, "Drawing part missing; ignoring"),
            }
        }
        Ok(anchors)
    }

    /// A copy of the workbook in which `region` is the only printable area.
    pub fn isolate_region(
        &self,
        sheet: &SheetEntry,
        region: &TableRegion,
    ) -> Result<Vec<u8>, RelayError> {
        let workbook = self.workbook_path();
        let mut replaced = HashMap::new();
        replaced.insert(
            workbook.clone(),
            rewrite_workbook(self.part_str(&workbook)?, sheet, region)?,
        );
        replaced.insert(
            sheet.path.clone(),
            rewrite_sheet(self.part_str(&sheet.path)?, region.is_landscape())?,
        );
        self.write_with(&replaced)
    }

    fn write_with(&self, replaced: &HashMap<String, Vec<u8>>) -> Result<Vec<u8>, RelayError> {
        use zip::write::{FileOptions, ZipWriter};
        use zip::CompressionMethod;

        let mut buffer = Vec::new();
        {
            let mut zip = ZipWriter::new(Cursor::new(&mut buffer));
            let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
            for (name, data) in &self.entries {
                let data = replaced.get(name).unwrap_or(data);
                zip.start_file(name.as_str(), options).map_err(corrupt)?;
                zip.write_all(data).map_err(corrupt)?;
            }
            zip.finish().map_err(corrupt)?;
        }
        Ok(buffer)
    }
}

// ── Relationships ────────────────────────────────────────────────────────

struct Relationship {
    id: String,
    kind: String,
    target: String,
}

fn relationships(xml: &str) -> Result<Vec<Relationship>, RelayError> {
    let mut reader = Reader::from_str(xml);
    let mut rels = Vec::new();
    loop {
        match reader.read_event().map_err(corrupt)? {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                    rels.push(Relationship {
                        id,
                        kind: attr(&e, b"Type").unwrap_or_default(),
                        target,
                    });
                }
            }
            _ => {}
        }
    }
    Ok(rels)
}

/// `xl/worksheets/sheet1.xml` → `xl/worksheets/_rels/sheet1.xml.rels`.
fn rels_path_for(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/_rels/{file}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

fn parent_dir(part: &str) -> &str {
    part.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Resolve a relationship target against the directory of its source part.
fn resolve_target(base_dir: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let mut parts: Vec<&str> = base_dir.split('/').filter(|p| !p.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

// ── Drawings ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct AnchorScan {
    in_anchor: bool,
    in_from: bool,
    field: Option<&'static str>,
    row: Option<u32>,
    col: Option<u32>,
    has_picture: bool,
}

fn drawing_anchors(xml: &str) -> Result<Vec<(u32, u32)>, RelayError> {
    let mut reader = Reader::from_str(xml);
    let mut scan = AnchorScan::default();
    let mut anchors = Vec::new();
    loop {
        match reader.read_event().map_err(corrupt)? {
            Event::Eof => break,
            Event::Start(e) => match e.local_name().as_ref() {
                b"twoCellAnchor" | b"oneCellAnchor" => {
                    scan = AnchorScan {
                        in_anchor: true,
                        ..AnchorScan::default()
                    }
                }
                b"from" if scan.in_anchor => scan.in_from = true,
                b"col" if scan.in_from => scan.field = Some("col"),
                b"row" if scan.in_from => scan.field = Some("row"),
                b"pic" if scan.in_anchor => scan.has_picture = true,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"pic" && scan.in_anchor => {
                scan.has_picture = true
            }
            Event::Text(t) => {
                if let Some(field) = scan.field {
                    let value = String::from_utf8_lossy(&t).trim().parse::<u32>().ok();
                    match field {
                        "col" => scan.col = value,
                        _ => scan.row = value,
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"col" | b"row" => scan.field = None,
                b"from" => scan.in_from = false,
                b"twoCellAnchor" | b"oneCellAnchor" => {
                    if let (true, Some(row), Some(col)) = (scan.has_picture, scan.row, scan.col) {
                        anchors.push((row + 1, col + 1));
                    }
                    scan = AnchorScan::default();
                }
                _ => {}
            },
            _ => {}
        }
    }
    Ok(anchors)
}

// ── XML helpers ──────────────────────────────────────────────────────────

/// Attribute value by local name (`r:id` matches `id`).
fn attr(e: &BytesStart, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .map(|a| {
            let raw = String::from_utf8_lossy(&a.value).into_owned();
            unescape(&raw).map(|v| v.into_owned()).unwrap_or(raw)
        })
}

/// Copy `e` without the attributes whose local names are in `drop`.
fn copy_without(e: &BytesStart, drop: &[&[u8]]) -> BytesStart<'static> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut out = BytesStart::new(name);
    for a in e.attributes().flatten() {
        if !drop.contains(&a.key.local_name().as_ref()) {
            out.push_attribute(a);
        }
    }
    out.into_owned()
}

/// Namespace prefix (with colon) of an element name, e.g. `x:` or ``.
fn prefix_of(e: &BytesStart) -> String {
    let full = e.name();
    let local = e.local_name();
    let p = full.as_ref().len() - local.as_ref().len();
    String::from_utf8_lossy(&full.as_ref()[..p]).into_owned()
}

struct XmlOut {
    writer: Writer<Cursor<Vec<u8>>>,
}

impl XmlOut {
    fn new() -> Self {
        Self {
            writer: Writer::new(Cursor::new(Vec::new())),
        }
    }

    fn write<'a>(&mut self, event: impl Into<Event<'a>>) -> Result<(), RelayError> {
        self.writer.write_event(event).map_err(corrupt)
    }

    fn finish(self) -> Vec<u8> {
        self.writer.into_inner().into_inner()
    }
}

/// Skips an element subtree while tracking nesting.
#[derive(Default)]
struct Skipper(usize);

impl Skipper {
    /// Feed an event; returns true when the event belongs to a skipped subtree.
    fn swallow(&mut self, event: &Event) -> bool {
        if self.0 == 0 {
            return false;
        }
        match event {
            Event::Start(_) => self.0 += 1,
            Event::End(_) => self.0 -= 1,
            _ => {}
        }
        true
    }

    fn skip_subtree(&mut self) {
        self.0 = 1;
    }
}


// ── Workbook rewrite ─────────────────────────────────────────────────────

fn quoted_sheet(name: &str) -> String {
    format!("'{}'", name.replace('\'', "''"))
}

fn contains_element(xml: &str, local: &[u8]) -> Result<bool, RelayError> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event().map_err(corrupt)? {
            Event::Eof => return Ok(false),
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == local => {
                return Ok(true)
            }
            _ => {}
        }
    }
}

struct WorkbookRewrite {
    prefix: String,
    tab: usize,
    formula: String,
    sheet_no: usize,
}

impl WorkbookRewrite {
    fn write_print_area(&self, out: &mut XmlOut) -> Result<(), RelayError> {
        let tag = format!("{}definedName", self.prefix);
        let mut start = BytesStart::new(tag.clone());
        start.push_attribute(("name", PRINT_AREA));
        start.push_attribute(("localSheetId", self.tab.to_string().as_str()));
        out.write(Event::Start(start))?;
        out.write(Event::Text(BytesText::from_escaped(partial_escape(&self.formula))))?;
        out.write(Event::End(BytesEnd::new(tag)))
    }

    fn write_defined_names(&self, out: &mut XmlOut) -> Result<(), RelayError> {
        let tag = format!("{}definedNames", self.prefix);
        out.write(Event::Start(BytesStart::new(tag.clone())))?;
        self.write_print_area(out)?;
        out.write(Event::End(BytesEnd::new(tag)))
    }

    fn sheet(&mut self, e: &BytesStart) -> BytesStart<'static> {
        let mut sheet = copy_without(e, &[b"state"]);
        if self.sheet_no != self.tab {
            sheet.push_attribute(("state", "hidden"));
        }
        self.sheet_no += 1;
        sheet
    }

    fn view(&self, e: &BytesStart) -> BytesStart<'static> {
        let tab = self.tab.to_string();
        let mut view = copy_without(e, &[b"activeTab", b"firstSheet"]);
        view.push_attribute(("activeTab", tab.as_str()));
        view.push_attribute(("firstSheet", tab.as_str()));
        view
    }
}

fn rewrite_workbook(
    xml: &str,
    target: &SheetEntry,
    region: &TableRegion,
) -> Result<Vec<u8>, RelayError> {
    let has_defined_names = contains_element(xml, b"definedNames")?;
    let mut wb = WorkbookRewrite {
        prefix: String::new(),
        tab: target.index.saturating_sub(1),
        formula: format!("{}!{}", quoted_sheet(&target.name), region.absolute_range()),
        sheet_no: 0,
    };
    let mut reader = Reader::from_str(xml);
    let mut out = XmlOut::new();
    let mut skip = Skipper::default();

    loop {
        let event = reader.read_event().map_err(corrupt)?;
        if skip.swallow(&event) {
            continue;
        }
        match event {
            Event::Eof => break,
            Event::Start(e) => {
                let local = e.local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"workbook" => {
                        wb.prefix = prefix_of(&e);
                        out.write(Event::Start(e))?;
                    }
                    b"sheet" => out.write(Event::Start(wb.sheet(&e)))?,
                    b"workbookView" => out.write(Event::Start(wb.view(&e)))?,
                    b"definedName" if attr(&e, b"name").as_deref() == Some(PRINT_AREA) => {
                        skip.skip_subtree()
                    }
                    _ => out.write(Event::Start(e))?,
                }
            }
            Event::Empty(e) => {
                let local = e.local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"sheet" => out.write(Event::Empty(wb.sheet(&e)))?,
                    b"workbookView" => out.write(Event::Empty(wb.view(&e)))?,
                    b"definedName" if attr(&e, b"name").as_deref() == Some(PRINT_AREA) => {}
                    b"definedNames" => wb.write_defined_names(&mut out)?,
                    _ => out.write(Event::Empty(e))?,
                }
            }
            Event::End(e) => {
                let local = e.local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"definedNames" => {
                        wb.write_print_area(&mut out)?;
                        out.write(Event::End(e))?;
                    }
                    b"sheets" => {
                        out.write(Event::End(e))?;
                        if !has_defined_names {
                            wb.write_defined_names(&mut out)?;
                        }
                    }
                    _ => out.write(Event::End(e))?,
                }
            }
            other => out.write(other)?,
        }
    }
    Ok(out.finish())
}

// ── Worksheet rewrite ────────────────────────────────────────────────────

struct SheetRewrite {
    prefix: String,
    landscape: bool,
    depth: usize,
    awaiting_first_child: bool,
    in_sheet_pr: bool,
    fit_flag_written: bool,
    margins_written: bool,
    setup_written: bool,
}

impl SheetRewrite {
    fn tag(&self, local: &str) -> String {
        format!("{}{local}", self.prefix)
    }

    fn fit_to_page(&self) -> BytesStart<'static> {
        let mut e = BytesStart::new(self.tag("pageSetUpPr"));
        e.push_attribute(("fitToPage", "1"));
        e
    }

    fn margins(&self) -> BytesStart<'static> {
        let mut e = BytesStart::new(self.tag("pageMargins"));
        for (k, v) in [
            ("left", "0.25"),
            ("right", "0.25"),
            ("top", "0.3"),
            ("bottom", "0.3"),
            ("header", "0.1"),
            ("footer", "0.1"),
        ] {
            e.push_attribute((k, v));
        }
        e
    }

    fn page_setup(&self, existing: Option<&BytesStart>) -> BytesStart<'static> {
        let mut e = match existing {
            Some(old) => copy_without(old, &[b"orientation", b"fitToWidth", b"fitToHeight"]),
            None => BytesStart::new(self.tag("pageSetup")),
        };
        let orientation = if self.landscape { "landscape" } else { "portrait" };
        e.push_attribute(("orientation", orientation));
        e.push_attribute(("fitToWidth", "1"));
        e.push_attribute(("fitToHeight", "1"));
        e
    }

    fn write_margins(&mut self, out: &mut XmlOut) -> Result<(), RelayError> {
        if !self.margins_written {
            out.write(Event::Empty(self.margins()))?;
            self.margins_written = true;
        }
        Ok(())
    }

    /// Margins (if still missing) followed by the page setup.
    fn write_setup(&mut self, out: &mut XmlOut, existing: Option<&BytesStart>) -> Result<(), RelayError> {
        self.write_margins(out)?;
        if !self.setup_written {
            out.write(Event::Empty(self.page_setup(existing)))?;
            self.setup_written = true;
        }
        Ok(())
    }

    fn write_sheet_pr(&mut self, out: &mut XmlOut) -> Result<(), RelayError> {
        let tag = self.tag("sheetPr");
        out.write(Event::Start(BytesStart::new(tag.clone())))?;
        out.write(Event::Empty(self.fit_to_page()))?;
        out.write(Event::End(BytesEnd::new(tag)))?;
        self.fit_flag_written = true;
        Ok(())
    }

    fn open(
        &mut self,
        e: BytesStart,
        is_start: bool,
        out: &mut XmlOut,
        skip: &mut Skipper,
    ) -> Result<(), RelayError> {
        let local = e.local_name().as_ref().to_vec();

        if self.depth == 0 && local == b"worksheet" && is_start {
            self.prefix = prefix_of(&e);
            self.depth = 1;
            self.awaiting_first_child = true;
            return out.write(Event::Start(e));
        }

        if self.depth == 1 {
            if self.awaiting_first_child {
                self.awaiting_first_child = false;
                if local != b"sheetPr" {
                    self.write_sheet_pr(out)?;
                }
            }
            match local.as_slice() {
                b"sheetPr" if is_start => self.in_sheet_pr = true,
                b"sheetPr" => {
                    out.write(Event::Start(e.borrow()))?;
                    out.write(Event::Empty(self.fit_to_page()))?;
                    self.fit_flag_written = true;
                    return out.write(Event::End(e.to_end().into_owned()));
                }
                b"pageMargins" => {
                    self.write_margins(out)?;
                    if is_start {
                        skip.skip_subtree();
                    }
                    return Ok(());
                }
                b"pageSetup" => {
                    self.write_setup(out, Some(&e))?;
                    if is_start {
                        skip.skip_subtree();
                    }
                    return Ok(());
                }
                name if AFTER_PAGE_SETUP.contains(&name) => self.write_setup(out, None)?,
                _ => {}
            }
        }

        if self.in_sheet_pr && self.depth == 2 && local == b"pageSetUpPr" {
            let mut flag = copy_without(&e, &[b"fitToPage"]);
            flag.push_attribute(("fitToPage", "1"));
            self.fit_flag_written = true;
            if is_start {
                skip.skip_subtree();
            }
            return out.write(Event::Empty(flag));
        }

        if is_start {
            self.depth += 1;
            out.write(Event::Start(e))
        } else {
            out.write(Event::Empty(e))
        }
    }

    fn close(&mut self, e: BytesEnd, out: &mut XmlOut) -> Result<(), RelayError> {
        let local = e.local_name().as_ref().to_vec();
        if self.in_sheet_pr && self.depth == 2 && local == b"sheetPr" {
            if !self.fit_flag_written {
                out.write(Event::Empty(self.fit_to_page()))?;
                self.fit_flag_written = true;
            }
            self.in_sheet_pr = false;
        }
        if self.depth == 1 && local == b"worksheet" {
            if self.awaiting_first_child {
                self.awaiting_first_child = false;
                self.write_sheet_pr(out)?;
            }
            self.write_setup(out, None)?;
        }
        self.depth = self.depth.saturating_sub(1);
        out.write(Event::End(e))
    }
}

fn rewrite_sheet(xml: &str, landscape: bool) -> Result<Vec<u8>, RelayError> {
    let mut reader = Reader::from_str(xml);
    let mut out = XmlOut::new();
    let mut skip = Skipper::default();
    let mut sheet = SheetRewrite {
        prefix: String::new(),
        landscape,
        depth: 0,
        awaiting_first_child: false,
        in_sheet_pr: false,
        fit_flag_written: false,
        margins_written: false,
        setup_written: false,
    };

    loop {
        let event = reader.read_event().map_err(corrupt)?;
        if skip.swallow(&event) {
            continue;
        }
        match event {
            Event::Eof => break,
            Event::Start(e) => sheet.open(e, true, &mut out, &mut skip)?,
            Event::Empty(e) => sheet.open(e, false, &mut out, &mut skip)?,
            Event::End(e) => sheet.close(e, &mut out)?,
            other => out.write(other)?,
        }
    }
    Ok(out.finish())
}

#[cfg(test)]
pub(crate) mod fixture {
    //! A two-sheet workbook with one picture on the first sheet.

    use std::io::{Cursor, Write};

    const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/><Override PartName="/xl/worksheets/sheet2.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/><Override PartName="/xl/drawings/drawing1.xml" ContentType="application/vnd.openxmlformats-officedocument.drawing+xml"/></Types>"#;

    const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

    const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><bookViews><workbookView activeTab="1"/></bookViews><sheets><sheet name="Data" sheetId="1" r:id="rId1"/><sheet name="Notes" sheetId="2" r:id="rId2"/></sheets></workbook>"#;

    const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet2.xml"/></Relationships>"#;

    const SHEET1: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheetData><row r="1"><c r="A1"><v>1</v></c><c r="B1"><v>2</v></c><c r="C1"><v>3</v></c></row><row r="2"><c r="A2"><v>4</v></c><c r="B2"><v>5</v></c><c r="C2"><v>6</v></c></row><row r="3"><c r="A3"><v>7</v></c><c r="B3"><v>8</v></c><c r="C3"><v>9</v></c></row><row r="12"><c r="A12"><v>10</v></c><c r="B12"><v>11</v></c><c r="C12"><v>12</v></c><c r="D12"><v>13</v></c><c r="E12"><v>14</v></c></row></sheetData><pageMargins left="0.7" right="0.7" top="0.75" bottom="0.75" header="0.3" footer="0.3"/><pageSetup paperSize="9" orientation="portrait"/><drawing r:id="rId1"/></worksheet>"#;

    const SHEET1_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/drawing" Target="../drawings/drawing1.xml"/></Relationships>"#;

    const SHEET2: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetPr><tabColor rgb="FFFF0000"/></sheetPr><sheetData><row r="2"><c r="B2"><v>1</v></c><c r="C2"><v>2</v></c></row><row r="3"><c r="B3"><v>3</v></c><c r="C3"><v>4</v></c></row></sheetData></worksheet>"#;

    const DRAWING1: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<xdr:wsDr xmlns:xdr="http://schemas.openxmlformats.org/drawingml/2006/spreadsheetDrawing" xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"><xdr:twoCellAnchor><xdr:from><xdr:col>1</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>4</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from><xdr:to><xdr:col>3</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>8</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:to><xdr:pic><xdr:nvPicPr><xdr:cNvPr id="2" name="Logo"/><xdr:cNvPicPr/></xdr:nvPicPr></xdr:pic><xdr:clientData/></xdr:twoCellAnchor><xdr:twoCellAnchor><xdr:from><xdr:col>9</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>0</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:from><xdr:to><xdr:col>12</xdr:col><xdr:colOff>0</xdr:colOff><xdr:row>5</xdr:row><xdr:rowOff>0</xdr:rowOff></xdr:to><xdr:graphicFrame macro=""/><xdr:clientData/></xdr:twoCellAnchor></xdr:wsDr>"#;

    /// Sheet "Data" holds A1:C3 plus A12:E12 and a picture anchored at B5;
    /// sheet "Notes" holds B2:C3.
    pub(crate) fn workbook() -> Vec<u8> {
        use zip::write::{FileOptions, ZipWriter};

        let parts = [
            ("[Content_Types].xml", CONTENT_TYPES),
            ("_rels/.rels", ROOT_RELS),
            ("xl/workbook.xml", WORKBOOK),
            ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS),
            ("xl/worksheets/sheet1.xml", SHEET1),
            ("xl/worksheets/_rels/sheet1.xml.rels", SHEET1_RELS),
            ("xl/worksheets/sheet2.xml", SHEET2),
            ("xl/drawings/drawing1.xml", DRAWING1),
        ];
        let mut buffer = Vec::new();
        {
            let mut zip = ZipWriter::new(Cursor::new(&mut buffer));
            for (name, body) in parts {
                zip.start_file(name, FileOptions::default()).unwrap();
                zip.write_all(body.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(sheet_index: usize, rows: (u32, u32), cols: (u32, u32)) -> TableRegion {
        TableRegion {
            sheet_index,
            min_row: rows.0,
            max_row: rows.1,
            min_col: cols.0,
            max_col: cols.1,
        }
    }

    fn package() -> XlsxPackage {
        XlsxPackage::read(&fixture::workbook()).unwrap()
    }

    #[test]
    fn target_resolution() {
        assert_eq!(resolve_target("xl", "worksheets/sheet1.xml"), "xl/worksheets/sheet1.xml");
        assert_eq!(
            resolve_target("xl/worksheets", "../drawings/drawing1.xml"),
            "xl/drawings/drawing1.xml"
        );
        assert_eq!(resolve_target("xl", "/xl/worksheets/sheet2.xml"), "xl/worksheets/sheet2.xml");
        assert_eq!(rels_path_for("xl/workbook.xml"), "xl/_rels/workbook.xml.rels");
    }

    #[test]
    fn sheets_in_tab_order() {
        let sheets = package().sheets().unwrap();
        assert_eq!(sheets.len(), 2);
        assert_eq!(sheets[0].name, "Data");
        assert_eq!(sheets[0].path, "xl/worksheets/sheet1.xml");
        assert_eq!(sheets[1].index, 2);
        assert_eq!(sheets[1].path, "xl/worksheets/sheet2.xml");
    }

    #[test]
    fn only_picture_anchors_are_reported() {
        let pkg = package();
        let sheets = pkg.sheets().unwrap();
        assert_eq!(pkg.image_anchors(&sheets[0]).unwrap(), vec![(5, 2)]);
        assert!(pkg.image_anchors(&sheets[1]).unwrap().is_empty());
    }

    #[test]
    fn isolation_hides_other_sheets_and_sets_print_area() {
        let pkg = package();
        let sheets = pkg.sheets().unwrap();
        let out = pkg
            .isolate_region(&sheets[0], &region(1, (1, 3), (1, 5)))
            .unwrap();
        let isolated = XlsxPackage::read(&out).unwrap();

        let wb = isolated.part_str("xl/workbook.xml").unwrap();
        assert!(wb.contains(r#"name="Notes" sheetId="2" r:id="rId2" state="hidden""#), "{wb}");
        assert!(!wb.contains(r#"name="Data" sheetId="1" r:id="rId1" state"#), "{wb}");
        assert!(wb.contains(r#"activeTab="0""#), "{wb}");
        assert!(wb.contains("_xlnm.Print_Area"), "{wb}");
        assert!(wb.contains("'Data'!$A$1:$E$3"), "{wb}");
        let sheets_end = wb.find("</sheets>").unwrap();
        assert!(wb.find("<definedNames>").unwrap() > sheets_end);

        let ws = isolated.part_str("xl/worksheets/sheet1.xml").unwrap();
        assert!(ws.contains(r#"<sheetPr><pageSetUpPr fitToPage="1"/></sheetPr><sheetData>"#), "{ws}");
        assert!(ws.contains(r#"left="0.25""#), "{ws}");
        assert!(!ws.contains(r#"left="0.7""#), "{ws}");
        assert!(ws.contains(r#"paperSize="9" orientation="landscape" fitToWidth="1" fitToHeight="1""#), "{ws}");
        assert_eq!(ws.matches("pageSetup ").count(), 1, "{ws}");
        let setup = ws.find("<pageSetup").unwrap();
        assert!(setup < ws.find("<drawing").unwrap());

        // untouched parts survive byte-for-byte
        assert_eq!(
            isolated.part("xl/drawings/drawing1.xml"),
            pkg.part("xl/drawings/drawing1.xml")
        );
    }

    #[test]
    fn existing_sheet_properties_gain_fit_flag() {
        let pkg = package();
        let sheets = pkg.sheets().unwrap();
        let out = pkg
            .isolate_region(&sheets[1], &region(2, (2, 3), (2, 3)))
            .unwrap();
        let isolated = XlsxPackage::read(&out).unwrap();

        let ws = isolated.part_str("xl/worksheets/sheet2.xml").unwrap();
        assert!(
            ws.contains(r#"<tabColor rgb="FFFF0000"/><pageSetUpPr fitToPage="1"/></sheetPr>"#),
            "{ws}"
        );
        assert!(ws.contains(r#"orientation="portrait""#), "{ws}");
        assert!(ws.ends_with("</worksheet>"), "{ws}");
        let sheet_data_end = ws.find("</sheetData>").unwrap();
        assert!(ws.find("<pageMargins").unwrap() > sheet_data_end);

        let wb = isolated.part_str("xl/workbook.xml").unwrap();
        assert!(wb.contains(r#"name="Data" sheetId="1" r:id="rId1" state="hidden""#), "{wb}");
        assert!(wb.contains("'Notes'!$B$2:$C$3"), "{wb}");
        assert!(wb.contains(r#"localSheetId="1""#), "{wb}");
    }

    #[test]
    fn previous_print_areas_are_replaced() {
        let xml = r#"<workbook><sheets><sheet name="A" sheetId="1" r:id="rId1"/></sheets><definedNames><definedName name="_xlnm.Print_Area" localSheetId="0">'A'!$A$1:$Z$99</definedName><definedName name="Keep">1</definedName></definedNames></workbook>"#;
        let sheet = SheetEntry {
            index: 1,
            name: "A".into(),
            path: "xl/worksheets/sheet1.xml".into(),
        };
        let out = rewrite_workbook(xml, &sheet, &region(1, (1, 2), (1, 2))).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(!out.contains("$Z$99"), "{out}");
        assert!(out.contains(r#"<definedName name="Keep">1</definedName>"#), "{out}");
        assert_eq!(out.matches("_xlnm.Print_Area").count(), 1, "{out}");
        assert!(out.contains("'A'!$A$1:$B$2"), "{out}");
    }

    #[test]
    fn sheet_names_with_quotes_are_escaped() {
        assert_eq!(quoted_sheet("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn garbage_is_corrupt_document() {
        let err = XlsxPackage::read(b"not a zip").unwrap_err();
        assert!(matches!(err, RelayError::CorruptDocument { .. }));
    }
}
