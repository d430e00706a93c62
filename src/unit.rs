/// Work units: one grass cache generation pass per season.
///
/// The set is closed. Each variant carries the season type the seasons
/// plugin expects in its INI, a display name, and the file extension its
/// generated cache files end up with after renaming.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Season type the seasons plugin uses for "follow the calendar".
/// Written back when generation is over.
pub const SEASONAL_MODE: u8 = 5;

/// Extension the worker writes raw cache files with.
pub const RAW_EXTENSION: &str = ".cgid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Season {
    NoSeasons,
    Winter,
    Spring,
    Summer,
    Autumn,
}

impl Season {
    /// Default processing order for seasonal generation.
    pub const SEASONAL: [Season; 4] = [
        Season::Winter,
        Season::Spring,
        Season::Summer,
        Season::Autumn,
    ];

    /// Value written to the seasons INI `Season Type` key.
    pub const fn season_type(self) -> u8 {
        match self {
            Season::NoSeasons => 0,
            Season::Winter => 1,
            Season::Spring => 2,
            Season::Summer => 3,
            Season::Autumn => 4,
        }
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            Season::NoSeasons => "No Seasons",
            Season::Winter => "Winter",
            Season::Spring => "Spring",
            Season::Summer => "Summer",
            Season::Autumn => "Autumn",
        }
    }

    /// Final extension of this unit's output files.
    ///
    /// `NoSeasons` keeps the raw extension: its outputs are used untagged.
    pub const fn extension(self) -> &'static str {
        match self {
            Season::NoSeasons => RAW_EXTENSION,
            Season::Winter => ".WIN.cgid",
            Season::Spring => ".SPR.cgid",
            Season::Summer => ".SUM.cgid",
            Season::Autumn => ".AUT.cgid",
        }
    }

    /// Short tag embedded in the extension (`WIN`, `SPR`, ...), if any.
    #[cfg(test)]
    pub const fn tag(self) -> Option<&'static str> {
        match self {
            Season::NoSeasons => None,
            Season::Winter => Some("WIN"),
            Season::Spring => Some("SPR"),
            Season::Summer => Some("SUM"),
            Season::Autumn => Some("AUT"),
        }
    }

    /// Whether this unit needs the seasons INI patched before launch.
    pub const fn is_seasonal(self) -> bool {
        !matches!(self, Season::NoSeasons)
    }

    #[cfg(test)]
    pub const fn all() -> [Season; 5] {
        [
            Season::NoSeasons,
            Season::Winter,
            Season::Spring,
            Season::Summer,
            Season::Autumn,
        ]
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown season '{0}' (expected winter, spring, summer, autumn or no_seasons)")]
pub struct UnknownSeason(pub String);

impl FromStr for Season {
    type Err = UnknownSeason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '_' | '-'))
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "winter" | "win" => Ok(Season::Winter),
            "spring" | "spr" => Ok(Season::Spring),
            "summer" | "sum" => Ok(Season::Summer),
            "autumn" | "aut" | "fall" => Ok(Season::Autumn),
            "noseasons" | "none" => Ok(Season::NoSeasons),
            _ => Err(UnknownSeason(s.to_string())),
        }
    }
}
