use std::fmt;
use std::str::FromStr;

use crate::classify::OutputMode;
use crate::grid::GridSpec;

const GEBCO_2025_URL: &str =
    "https://gis.ccom.unh.edu/server/rest/services/GEBCO2025/GEBCO_2025_IS/ImageServer";
const GEBCO_2025_TID_URL: &str =
    "https://gis.ccom.unh.edu/server/rest/services/GEBCO2025/GEBCO_2025_TID_IS/ImageServer";

pub const GEBCO_ATTRIBUTION: &str = "GEBCO Compilation Group (2025) GEBCO 2025 Grid \
     (doi:10.5285/37c52e96-24ea-67ce-e063-7086abc05f29)";

/// The two supported source grids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    /// Combined bathymetry and land elevation, 16-bit signed metres.
    Gebco,
    /// Type identifier (TID) grid, 8-bit codes describing each cell's source.
    Tid,
}

impl DatasetKind {
    pub fn grid(&self) -> GridSpec {
        GridSpec::GEBCO_2025
    }

    /// Default ImageServer endpoint.
    pub fn service_url(&self) -> &'static str {
        match self {
            DatasetKind::Gebco => GEBCO_2025_URL,
            DatasetKind::Tid => GEBCO_2025_TID_URL,
        }
    }

    /// Prefix used for output file names.
    pub fn file_stem(&self) -> &'static str {
        match self {
            DatasetKind::Gebco => "GEBCO_2025",
            DatasetKind::Tid => "GEBCO_2025_TID",
        }
    }

    /// The TID grid only has its implicit mode; the combined grid has all of them.
    pub fn supports(&self, mode: OutputMode) -> bool {
        match self {
            DatasetKind::Gebco => true,
            DatasetKind::Tid => mode == OutputMode::Combined,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Gebco => "gebco",
            DatasetKind::Tid => "tid",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gebco" | "gebco_2025" => Ok(DatasetKind::Gebco),
            "tid" | "gebco_2025_tid" => Ok(DatasetKind::Tid),
            other => Err(format!("unknown dataset '{}' (expected gebco or tid)", other)),
        }
    }
}
