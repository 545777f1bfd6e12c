//! Document model of the simulated backend
//!
//! Just enough PDF structure is understood to answer the exports the crate
//! consumes: the page tree with inherited `/MediaBox`, `/Rotate`, shown text
//! from content streams, the `/Info` dictionary, `/Encrypt` with a plain user
//! password, `/PageMode`, and the offsets of every `%%EOF` marker.
//!
//! [`SampleDocument`] writes files this parser understands, with a valid
//! cross-reference table, so tests and benches can build inputs in memory.

use std::collections::HashMap;
use std::fmt::Write as _;

use super::{ERR_FORMAT, ERR_PASSWORD};

/// Width and height of an A4 page in points
pub const A4: (f32, f32) = (595.275_573_730_468_8, 841.889_709_472_656_2);

/// Width and height of a US letter page in points
pub const LETTER: (f32, f32) = (612.0, 792.0);

const MAX_TREE_DEPTH: usize = 16;

#[derive(Debug, Clone)]
pub(crate) struct SimDocument {
    pub version: i32,
    pub pages: Vec<SimPage>,
    pub info: HashMap<String, String>,
    pub trailer_ends: Vec<u32>,
    pub permissions: u32,
    pub security_revision: i32,
    pub page_mode: i32,
}

#[derive(Debug, Clone)]
pub(crate) struct SimPage {
    pub media_box: [f32; 4],
    /// Quarter turns clockwise, 0..=3
    pub rotation: i32,
    pub text: String,
    pub transparent: bool,
    pub annotations: usize,
}

impl SimPage {
    fn raw_size(&self) -> (f32, f32) {
        let [x0, y0, x1, y1] = self.media_box;
        ((x1 - x0).abs(), (y1 - y0).abs())
    }

    /// Width as displayed, after rotation
    pub fn width(&self) -> f32 {
        let (w, h) = self.raw_size();
        if self.rotation % 2 == 1 {
            h
        } else {
            w
        }
    }

    /// Height as displayed, after rotation
    pub fn height(&self) -> f32 {
        let (w, h) = self.raw_size();
        if self.rotation % 2 == 1 {
            w
        } else {
            h
        }
    }
}

/// Parse a document, returning an `FPDF_ERR_*` code on failure
pub(crate) fn parse(bytes: &[u8], password: Option<&str>) -> Result<SimDocument, u32> {
    let text = String::from_utf8_lossy(bytes);
    let version = header_version(&text).ok_or(ERR_FORMAT)?;

    let trailer_ends: Vec<u32> = text
        .match_indices("%%EOF")
        .map(|(pos, marker)| (pos + marker.len()) as u32)
        .collect();
    if trailer_ends.is_empty() {
        return Err(ERR_FORMAT);
    }

    let objects = parse_objects(&text);
    let trailer = text
        .rfind("trailer")
        .map(|pos| &text[pos + "trailer".len()..])
        .ok_or(ERR_FORMAT)?;

    let catalog = reference(trailer, "/Root")
        .and_then(|id| objects.get(&id))
        .ok_or(ERR_FORMAT)?;

    let mut pages = Vec::new();
    if let Some(root) = reference(catalog, "/Pages") {
        collect_pages(&objects, root, [0.0, 0.0, LETTER.0, LETTER.1], 0, &mut pages)?;
    }

    let info = reference(trailer, "/Info")
        .and_then(|id| objects.get(&id))
        .map(|dict| strings(dict))
        .unwrap_or_default();

    let (permissions, security_revision) = match reference(trailer, "/Encrypt") {
        Some(id) => {
            let dict = objects.get(&id).ok_or(ERR_FORMAT)?;
            let expected = strings(dict).remove("U").unwrap_or_default();
            if !expected.is_empty() && password != Some(expected.as_str()) {
                return Err(ERR_PASSWORD);
            }
            let permissions = number(dict, "/P").map(|p| p as i32 as u32).unwrap_or(u32::MAX);
            let revision = number(dict, "/R").map(|r| r as i32).unwrap_or(-1);
            (permissions, revision)
        }
        None => (u32::MAX, -1),
    };

    let page_mode = match name(catalog, "/PageMode") {
        None | Some("UseNone") => 0,
        Some("UseOutlines") => 1,
        Some("UseThumbs") => 2,
        Some("FullScreen") => 3,
        Some("UseOC") => 4,
        Some("UseAttachments") => 5,
        Some(_) => -1,
    };

    Ok(SimDocument {
        version,
        pages,
        info,
        trailer_ends,
        permissions,
        security_revision,
        page_mode,
    })
}

fn header_version(text: &str) -> Option<i32> {
    let rest = text.strip_prefix("%PDF-")?;
    let line = rest.lines().next()?.trim();
    let (major, minor) = line.split_once('.')?;
    let major: i32 = major.parse().ok()?;
    let minor: i32 = minor.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse().ok()?;
    Some(major * 10 + minor)
}

fn collect_pages(
    objects: &HashMap<u32, String>,
    id: u32,
    inherited_box: [f32; 4],
    depth: usize,
    pages: &mut Vec<SimPage>,
) -> Result<(), u32> {
    if depth > MAX_TREE_DEPTH {
        return Err(ERR_FORMAT);
    }
    let dict = objects.get(&id).ok_or(ERR_FORMAT)?;
    let media_box = media_box(dict).unwrap_or(inherited_box);

    match name(dict, "/Type") {
        Some("Pages") => {
            for kid in array(dict, "/Kids").unwrap_or_default().chunks(3) {
                if let Some(kid) = kid.first().and_then(|t| t.parse::<u32>().ok()) {
                    collect_pages(objects, kid, media_box, depth + 1, pages)?;
                }
            }
        }
        Some("Page") => {
            let rotation = number(dict, "/Rotate").map(|r| r as i32).unwrap_or(0);
            let text = reference(dict, "/Contents")
                .and_then(|c| objects.get(&c))
                .map(|stream| shown_text(stream))
                .unwrap_or_default();
            pages.push(SimPage {
                media_box,
                rotation: rotation.rem_euclid(360) / 90,
                text,
                transparent: find_key(dict, "/Group").is_some() && dict.contains("/Transparency"),
                annotations: array(dict, "/Annots").map(|a| a.len() / 3).unwrap_or(0),
            });
        }
        _ => return Err(ERR_FORMAT),
    }
    Ok(())
}

fn parse_objects(text: &str) -> HashMap<u32, String> {
    let mut objects = HashMap::new();
    for chunk in text.split("endobj") {
        let Some(pos) = chunk.find(" obj") else {
            continue;
        };
        let mut header = chunk[..pos].split_whitespace().rev();
        let _generation = header.next();
        if let Some(id) = header.next().and_then(|t| t.parse::<u32>().ok()) {
            objects.insert(id, chunk[pos + " obj".len()..].to_string());
        }
    }
    objects
}

/// Position right after `key`, skipping matches that are a prefix of a longer name
fn find_key(dict: &str, key: &str) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = dict[from..].find(key) {
        let end = from + pos + key.len();
        match dict[end..].chars().next() {
            Some(c) if c.is_ascii_alphanumeric() => from = end,
            _ => return Some(end),
        }
    }
    None
}

fn value_after<'a>(dict: &'a str, key: &str) -> Option<&'a str> {
    find_key(dict, key).map(|end| dict[end..].trim_start())
}

fn name<'a>(dict: &'a str, key: &str) -> Option<&'a str> {
    let rest = value_after(dict, key)?.strip_prefix('/')?;
    let end = rest
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

fn number(dict: &str, key: &str) -> Option<f32> {
    let rest = value_after(dict, key)?;
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == '+' || c == '.'))
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

fn reference(dict: &str, key: &str) -> Option<u32> {
    let mut tokens = value_after(dict, key)?.split_whitespace();
    let id = tokens.next()?.parse().ok()?;
    let _generation = tokens.next()?;
    (tokens.next()? == "R").then_some(id)
}

fn array<'a>(dict: &'a str, key: &str) -> Option<Vec<&'a str>> {
    let rest = value_after(dict, key)?.strip_prefix('[')?;
    let end = rest.find(']')?;
    Some(rest[..end].split_whitespace().collect())
}

fn media_box(dict: &str) -> Option<[f32; 4]> {
    let values: Vec<f32> = array(dict, "/MediaBox")?
        .iter()
        .filter_map(|t| t.parse().ok())
        .collect();
    values.try_into().ok()
}

/// Parse a literal string starting at `(`, returning it and the bytes consumed
fn literal(input: &str) -> Option<(String, usize)> {
    let mut chars = input.char_indices();
    if chars.next()?.1 != '(' {
        return None;
    }
    let mut out = String::new();
    let mut depth = 1;
    let mut escaped = false;
    for (pos, c) in chars {
        if escaped {
            out.push(match c {
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => other,
            });
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '(' => {
                depth += 1;
                out.push(c);
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some((out, pos + 1));
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    None
}

/// All `/Key (value)` pairs of a dictionary
fn strings(dict: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut rest = dict;
    while let Some(slash) = rest.find('/') {
        rest = &rest[slash + 1..];
        let end = rest
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(rest.len());
        let key = &rest[..end];
        let after = rest[end..].trim_start();
        if let Some((value, consumed)) = literal(after) {
            out.insert(key.to_string(), value);
            rest = &after[consumed..];
        } else {
            rest = &rest[end..];
        }
    }
    out
}

/// Concatenated operands of every `Tj` operator, one line per operator
fn shown_text(stream: &str) -> String {
    let mut lines = Vec::new();
    let mut rest = stream;
    while let Some(open) = rest.find('(') {
        let Some((value, consumed)) = literal(&rest[open..]) else {
            break;
        };
        let after = &rest[open + consumed..];
        if after.trim_start().starts_with("Tj") {
            lines.push(value);
        }
        rest = after;
    }
    lines.join("\n")
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('(', "\\(")
        .replace(')', "\\)")
}

/// One page of a [`SampleDocument`]
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePage {
    pub width: f32,
    pub height: f32,
    pub rotation: u16,
    pub text: Option<String>,
    pub transparent: bool,
    pub annotations: usize,
}

impl SamplePage {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            width,
            height,
            rotation: 0,
            text: None,
            transparent: false,
            annotations: 0,
        }
    }

    pub fn a4() -> Self {
        Self::new(A4.0, A4.1)
    }

    pub fn letter() -> Self {
        Self::new(LETTER.0, LETTER.1)
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Rotation in degrees, a multiple of 90
    pub fn with_rotation(mut self, degrees: u16) -> Self {
        self.rotation = degrees;
        self
    }

    pub fn with_transparency(mut self) -> Self {
        self.transparent = true;
        self
    }

    pub fn with_annotations(mut self, count: usize) -> Self {
        self.annotations = count;
        self
    }
}

/// Builder for small PDF files understood by the simulated backend
#[derive(Debug, Clone)]
pub struct SampleDocument {
    version: (u8, u8),
    pages: Vec<SamplePage>,
    info: Vec<(String, String)>,
    page_mode: Option<String>,
    user_password: Option<String>,
    permissions: i32,
    incremental_updates: usize,
}

impl Default for SampleDocument {
    fn default() -> Self {
        Self {
            version: (1, 7),
            pages: Vec::new(),
            info: Vec::new(),
            page_mode: None,
            user_password: None,
            permissions: -4,
            incremental_updates: 0,
        }
    }
}

impl SampleDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// A document of `count` blank A4 pages
    pub fn a4_pages(count: usize) -> Self {
        (0..count).fold(Self::new(), |doc, _| doc.page(SamplePage::a4()))
    }

    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.version = (major, minor);
        self
    }

    pub fn page(mut self, page: SamplePage) -> Self {
        self.pages.push(page);
        self
    }

    /// Add an `/Info` entry such as `Title` or `Author`
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.push((key.into(), value.into()));
        self
    }

    pub fn page_mode(mut self, mode: impl Into<String>) -> Self {
        self.page_mode = Some(mode.into());
        self
    }

    /// Protect the document with a user password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.user_password = Some(password.into());
        self
    }

    /// `/P` value of the encryption dictionary (only written with a password)
    pub fn permissions(mut self, permissions: i32) -> Self {
        self.permissions = permissions;
        self
    }

    /// Append an empty incremental update (one more `%%EOF`)
    pub fn incremental_update(mut self) -> Self {
        self.incremental_updates += 1;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let page_count = self.pages.len();
        let page_id = |i: usize| 3 + 2 * i;
        let annotation_base = 3 + 2 * page_count;
        let annotation_total: usize = self.pages.iter().map(|p| p.annotations).sum();
        let info_id = annotation_base + annotation_total;
        let encrypt_id = info_id + 1;

        let mut bodies = Vec::new();

        let mut catalog = String::from("<< /Type /Catalog /Pages 2 0 R");
        if let Some(mode) = &self.page_mode {
            let _ = write!(catalog, " /PageMode /{mode}");
        }
        catalog.push_str(" >>");
        bodies.push(catalog);

        let kids: Vec<String> = (0..page_count).map(|i| format!("{} 0 R", page_id(i))).collect();
        bodies.push(format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            kids.join(" "),
            page_count
        ));

        let mut next_annotation = annotation_base;
        for (i, page) in self.pages.iter().enumerate() {
            let mut dict = format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] /Contents {} 0 R",
                page.width,
                page.height,
                page_id(i) + 1
            );
            if page.rotation != 0 {
                let _ = write!(dict, " /Rotate {}", page.rotation);
            }
            if page.transparent {
                dict.push_str(" /Group << /S /Transparency /CS /DeviceRGB >>");
            }
            if page.annotations > 0 {
                let refs: Vec<String> = (next_annotation..next_annotation + page.annotations)
                    .map(|id| format!("{id} 0 R"))
                    .collect();
                next_annotation += page.annotations;
                let _ = write!(dict, " /Annots [{}]", refs.join(" "));
            }
            dict.push_str(" >>");
            bodies.push(dict);

            let mut content = String::from("BT /F1 12 Tf 72 720 Td");
            if let Some(text) = &page.text {
                for (n, line) in text.split('\n').enumerate() {
                    if n > 0 {
                        content.push_str(" 0 -14 Td");
                    }
                    let _ = write!(content, " ({}) Tj", escape(line));
                }
            }
            content.push_str(" ET");
            bodies.push(format!(
                "<< /Length {} >>\nstream\n{}\nendstream",
                content.len(),
                content
            ));
        }

        for _ in 0..annotation_total {
            bodies.push("<< /Type /Annot /Subtype /Square /Rect [10 10 50 50] >>".to_string());
        }

        let info: Vec<String> = self
            .info
            .iter()
            .map(|(k, v)| format!("/{k} ({})", escape(v)))
            .collect();
        bodies.push(format!("<< {} >>", info.join(" ")));

        if let Some(password) = &self.user_password {
            bodies.push(format!(
                "<< /Filter /Standard /V 2 /R 3 /P {} /U ({}) >>",
                self.permissions,
                escape(password)
            ));
        }

        let (major, minor) = self.version;
        let mut out = format!("%PDF-{major}.{minor}\n");
        let mut offsets = Vec::with_capacity(bodies.len());
        for (i, body) in bodies.iter().enumerate() {
            offsets.push(out.len());
            let _ = write!(out, "{} 0 obj\n{}\nendobj\n", i + 1, body);
        }

        let mut trailer = format!("<< /Size {} /Root 1 0 R /Info {info_id} 0 R", bodies.len() + 1);
        if self.user_password.is_some() {
            let _ = write!(trailer, " /Encrypt {encrypt_id} 0 R");
        }
        trailer.push_str(" >>");

        let xref = out.len();
        let _ = write!(out, "xref\n0 {}\n0000000000 65535 f \n", bodies.len() + 1);
        for offset in &offsets {
            let _ = writeln!(out, "{offset:010} 00000 n ");
        }
        let _ = write!(out, "trailer\n{trailer}\nstartxref\n{xref}\n%%EOF\n");

        for _ in 0..self.incremental_updates {
            let start = out.len();
            let _ = write!(out, "trailer\n{trailer}\nstartxref\n{start}\n%%EOF\n");
        }

        out.into_bytes()
    }
}
