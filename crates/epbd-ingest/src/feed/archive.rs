//! Picking the mutation document out of a downloaded zip archive

use chrono::NaiveDate;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::{IngestError, Result};

/// Local file header signature
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

pub fn is_zip(data: &[u8]) -> bool {
    data.starts_with(ZIP_MAGIC)
}

/// Member name the provider uses for the file of `date`: `d20240307.xml`
pub fn dated_member_name(date: NaiveDate) -> String {
    format!("d{}.xml", date.format("%Y%m%d"))
}

fn is_xml(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
}

/// Extract the XML document from `data`.
///
/// Selection order:
/// 1. `d<YYYYMMDD>.xml` when a date is given and the archive has it
/// 2. the only file, if the archive holds exactly one and it is `.xml`
/// 3. the first `.xml` file, ignoring the rest
pub fn select_xml_member(data: &[u8], date: Option<NaiveDate>) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;

    let mut names = Vec::new();
    for i in 0..archive.len() {
        let file = archive.by_index(i)?;
        if !file.is_dir() {
            names.push((i, file.name().to_string()));
        }
    }

    let preferred = date.map(dated_member_name).and_then(|wanted| {
        names.iter().find(|(_, name)| {
            let base = name.rsplit('/').next().unwrap_or(name);
            base == wanted
        })
    });

    let (index, name) = match preferred {
        Some(entry) => entry.clone(),
        None => {
            let first_xml = names
                .iter()
                .find(|(_, name)| is_xml(name))
                .cloned()
                .ok_or(IngestError::NoXmlInArchive)?;
            if names.len() > 1 {
                info!(
                    files = names.len(),
                    selected = %first_xml.1,
                    "Found multiple files in archive; only reading the first XML file"
                );
            }
            first_xml
        },
    };

    let mut file = archive.by_index(index)?;
    let mut contents = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
    file.read_to_end(&mut contents)?;
    debug!(member = %name, bytes = contents.len(), "Extracted mutation document");

    Ok(contents)
}
