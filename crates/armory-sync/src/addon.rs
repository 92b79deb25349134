//! Addon descriptors and zip packaging.

use std::io::{Cursor, Write};

use askama::Template;
use chrono::NaiveDate;
use serde::Serialize;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::chunk::Segment;

pub const DEFAULT_ADDON_NAME: &str = "IsengardArmory";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub segment_count: usize,
    pub generated_on: NaiveDate,
    pub account_count: u64,
    pub character_count: u64,
}

impl Manifest {
    /// `dd.mm.yyyy`, the format the in-game addon displays.
    pub fn generated_on_label(&self) -> String {
        self.generated_on.format("%d.%m.%Y").to_string()
    }
}

#[derive(Template)]
#[template(path = "addon.toc", escape = "none")]
struct TocTemplate<'a> {
    addon_name: &'a str,
    generated_on: String,
    segment_files: Vec<String>,
}

#[derive(Template)]
#[template(path = "addon.lua", escape = "none")]
struct IndexTemplate<'a> {
    addon_name: &'a str,
    generated_on: String,
    segments_table: String,
    total_segments: usize,
    account_count: u64,
    character_count: u64,
}

/// One file inside the archive, relative to the addon directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// Segment files in index order, then the `.toc` and the index `.lua`.
pub fn render_addon(
    addon_name: &str,
    segments: &[Segment],
    manifest: &Manifest,
) -> Result<Vec<AddonFile>, askama::Error> {
    let generated_on = manifest.generated_on_label();

    let toc = TocTemplate {
        addon_name,
        generated_on: generated_on.clone(),
        segment_files: segments.iter().map(Segment::file_name).collect(),
    }
    .render()?;

    let variables = segments.iter().map(Segment::variable).collect::<Vec<_>>();
    let segments_table = if variables.is_empty() {
        "{}".to_string()
    } else {
        format!("{{ {} }}", variables.join(", "))
    };
    let index = IndexTemplate {
        addon_name,
        generated_on,
        segments_table,
        total_segments: manifest.segment_count,
        account_count: manifest.account_count,
        character_count: manifest.character_count,
    }
    .render()?;

    let mut files = segments
        .iter()
        .map(|segment| AddonFile {
            name: segment.file_name(),
            contents: segment.body.clone().into_bytes(),
        })
        .collect::<Vec<_>>();
    files.push(AddonFile {
        name: format!("{addon_name}.toc"),
        contents: toc.into_bytes(),
    });
    files.push(AddonFile {
        name: format!("{addon_name}.lua"),
        contents: index.into_bytes(),
    });
    Ok(files)
}

/// Builds the archive in memory with every file under `<addon_name>/`.
pub fn package_zip(addon_name: &str, files: &[AddonFile]) -> zip::result::ZipResult<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for file in files {
        writer.start_file(format!("{addon_name}/{}", file.name), options)?;
        writer.write_all(&file.contents)?;
    }
    Ok(writer.finish()?.into_inner())
}
