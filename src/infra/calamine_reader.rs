use calamine::{open_workbook_auto, Data, Range, Reader};
use std::path::Path;
use tracing::debug;

use crate::app::ports::WorkbookReader;
use crate::error::{PipelineError, Result};

/// Reads the first worksheet of xlsx / xlsm / xls / ods files; the first used
/// row is the header
#[derive(Debug, Clone, Copy, Default)]
pub struct CalamineWorkbookReader;

impl CalamineWorkbookReader {
    pub fn new() -> Self {
        Self
    }

    fn first_sheet(path: &Path) -> Result<Range<Data>> {
        let mut workbook = open_workbook_auto(path)?;
        let sheet_name = workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| PipelineError::Workbook(format!("{} has no worksheets", path.display())))?;
        debug!(file = %path.display(), sheet = %sheet_name, "Opened worksheet");
        Ok(workbook.worksheet_range(&sheet_name)?)
    }
}

impl WorkbookReader for CalamineWorkbookReader {
    fn read_header(&self, path: &Path) -> Result<Vec<String>> {
        let range = Self::first_sheet(path)?;
        let header = range
            .rows()
            .next()
            .map(|row| row.iter().map(|c| cell_to_string(c).unwrap_or_default()).collect())
            .unwrap_or_default();
        Ok(header)
    }

    fn read_columns(&self, path: &Path, columns: &[usize]) -> Result<Vec<Vec<Option<String>>>> {
        let range = Self::first_sheet(path)?;
        let rows = range
            .rows()
            .skip(1)
            .map(|row| columns.iter().map(|&c| row.get(c).and_then(cell_to_string)).collect())
            .collect();
        Ok(rows)
    }
}

/// Cell text, or `None` for empty and error cells
fn cell_to_string(cell: &Data) -> Option<String> {
    let text = match cell {
        Data::Empty | Data::Error(_) => return None,
        Data::String(s) => s.trim().to_string(),
        Data::Int(n) => n.to_string(),
        // Site numbers stored as numbers come back as floats; 101.0 prints as "101"
        Data::Float(f) => format!("{}", f),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => format!("{}", dt),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
