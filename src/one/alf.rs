//! ALF path conventions.
//!
//! Sessions live in `<lab>/Subjects/<subject>/<yyyy-mm-dd>/<nnn>`. Dataset
//! files below a session may carry their revision UUID as the last dotted
//! part of the file stem, e.g. `_ibl_wheel.position.<uuid>.npy`.

use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::ConvertError;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// True for the canonical hyphenated UUID form.
pub fn is_uuid_string(text: &str) -> bool {
    text.len() == 36 && Uuid::try_parse(text).is_ok()
}

/// Pack a UUID into two little-endian `i64`s, the layout of the `*_0`/`*_1`
/// columns of the cache tables.
pub fn uuid_to_ints(uuid: &Uuid) -> [i64; 2] {
    let bytes = uuid.as_bytes();
    let mut lo = [0u8; 8];
    let mut hi = [0u8; 8];
    lo.copy_from_slice(&bytes[..8]);
    hi.copy_from_slice(&bytes[8..]);
    [i64::from_le_bytes(lo), i64::from_le_bytes(hi)]
}

pub fn ints_to_uuid(ints: [i64; 2]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&ints[0].to_le_bytes());
    bytes[8..].copy_from_slice(&ints[1].to_le_bytes());
    Uuid::from_bytes(bytes)
}

/// The identifying parts of a session folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParts {
    /// Only known when the path contains the `<lab>/Subjects` prefix.
    pub lab: Option<String>,
    pub subject: String,
    pub date: NaiveDate,
    pub number: u32,
}

impl SessionParts {
    /// `<lab>/Subjects/<subject>/<date>/<number>`, or without the lab prefix
    /// when the lab is unknown.
    pub fn to_path(&self) -> Utf8PathBuf {
        let mut path = Utf8PathBuf::new();
        if let Some(lab) = &self.lab {
            path.push(lab);
            path.push("Subjects");
        }
        path.push(&self.subject);
        path.push(self.date.format(DATE_FORMAT).to_string());
        path.push(format!("{:03}", self.number));
        path
    }
}

fn parse_number(text: &str) -> Option<u32> {
    if (1..=3).contains(&text.len()) && text.bytes().all(|b| b.is_ascii_digit()) {
        text.parse().ok()
    } else {
        None
    }
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    if text.len() == 10 {
        NaiveDate::parse_from_str(text, DATE_FORMAT).ok()
    } else {
        None
    }
}

/// Locate the first `<subject>/<date>/<number>` run in a path.
///
/// Returns the index of the number component together with the parsed parts.
fn find_session(components: &[&str]) -> Option<(usize, SessionParts)> {
    (2..components.len()).find_map(|i| {
        let number = parse_number(components[i])?;
        let date = parse_date(components[i - 1])?;
        let subject = components[i - 2];
        if subject.is_empty() || subject == "/" {
            return None;
        }

        let lab =
            (i >= 4 && components[i - 3] == "Subjects").then(|| components[i - 4].to_string());

        Some((
            i,
            SessionParts {
                lab,
                subject: subject.to_string(),
                date,
                number,
            },
        ))
    })
}

/// Parse the session a path belongs to. Anything below the session folder is ignored.
pub fn parse_session(path: impl AsRef<Utf8Path>) -> Option<SessionParts> {
    let components: Vec<&str> = path.as_ref().iter().collect();
    find_session(&components).map(|(_, parts)| parts)
}

/// Truncate a path to its session folder.
pub fn session_path_of(path: impl AsRef<Utf8Path>) -> Option<Utf8PathBuf> {
    let components: Vec<&str> = path.as_ref().iter().collect();
    let (end, _) = find_session(&components)?;
    Some(components[..=end].iter().collect())
}

/// Insert a revision UUID before the file extension.
///
/// A path already tagged with the same UUID is returned unchanged.
pub fn add_uuid_string(path: impl AsRef<Utf8Path>, uuid: &Uuid) -> Utf8PathBuf {
    let path = path.as_ref();
    let uuid = uuid.hyphenated().to_string();

    let Some(name) = path.file_name() else {
        return path.to_path_buf();
    };
    let (stem, extension) = match name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => (stem, Some(extension)),
        _ => (name, None),
    };

    if stem.rsplit('.').next() == Some(uuid.as_str()) {
        tracing::warn!("UUID already present in {}", path);
        return path.to_path_buf();
    }

    let tagged = match extension {
        Some(extension) => format!("{stem}.{uuid}.{extension}"),
        None => format!("{stem}.{uuid}"),
    };
    path.with_file_name(tagged)
}

/// Strip a revision UUID from a file name, if it has one.
pub fn remove_uuid_file(path: impl AsRef<Utf8Path>) -> Utf8PathBuf {
    let path = path.as_ref();
    let Some(name) = path.file_name() else {
        return path.to_path_buf();
    };

    let parts: Vec<&str> = name.split('.').collect();
    match parts.iter().position(|part| is_uuid_string(part)) {
        Some(i) if i > 0 => {
            let kept: Vec<&str> = parts
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, part)| *part)
                .collect();
            path.with_file_name(kept.join("."))
        }
        _ => path.to_path_buf(),
    }
}

/// An experiment reference of the form `yyyy-mm-dd_n_subject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRef {
    pub date: NaiveDate,
    pub number: u32,
    pub subject: String,
}

impl SessionRef {
    pub fn from_parts(parts: &SessionParts) -> Self {
        Self {
            date: parts.date,
            number: parts.number,
            subject: parts.subject.clone(),
        }
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.date.format(DATE_FORMAT),
            self.number,
            self.subject
        )
    }
}

impl FromStr for SessionRef {
    type Err = ConvertError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = || ConvertError::InvalidRef(text.to_string());

        // subjects may themselves contain underscores
        let mut parts = text.splitn(3, '_');
        let date = parts.next().and_then(parse_date).ok_or_else(invalid)?;
        let number = parts
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(invalid)?;
        let subject = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;

        Ok(Self {
            date,
            number,
            subject: subject.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHEEL_ID: &str = "257ff7ae-9ab4-35dc-bac0-245cdc81f6d1";

    #[test]
    fn test_int_packing() {
        let uuid = Uuid::parse_str(WHEEL_ID).unwrap();
        let ints = uuid_to_ints(&uuid);

        assert_eq!(ints, [-2578956635146322139, -3317321292073090886]);
        assert_eq!(ints_to_uuid(ints), uuid);
    }

    #[test]
    fn test_is_uuid_string() {
        assert!(is_uuid_string(WHEEL_ID));
        assert!(!is_uuid_string("fakeid"));
        assert!(!is_uuid_string("257ff7ae9ab435dcbac0245cdc81f6d1"));
    }

    #[test]
    fn test_session_path_of() {
        let path = "/home/user/lab/FMR008/2021-03-18/001/alf/probe00/spikes.times.npy";
        assert_eq!(
            session_path_of(path).unwrap(),
            Utf8Path::new("/home/user/lab/FMR008/2021-03-18/001")
        );

        let parts = parse_session(path).unwrap();
        assert_eq!(parts.subject, "FMR008");
        assert_eq!(parts.number, 1);
        assert_eq!(parts.lab, None);

        assert!(session_path_of("/data/FMR008/2021-03-18").is_none());
        assert!(session_path_of("/data/FMR008/2021-13-18/001").is_none());
        assert!(session_path_of("/data/FMR008/2021-03-18/0001").is_none());
    }

    #[test]
    fn test_lab_from_subjects_folder() {
        let parts = parse_session("cache/angelakilab/Subjects/FMR019/2021-03-18/002").unwrap();
        assert_eq!(parts.lab.as_deref(), Some("angelakilab"));
        assert_eq!(
            parts.to_path(),
            Utf8Path::new("angelakilab/Subjects/FMR019/2021-03-18/002")
        );
    }

    #[test]
    fn test_uuid_file_names() {
        let uuid = Uuid::parse_str(WHEEL_ID).unwrap();
        let path = Utf8Path::new("alf/_ibl_wheel.position.npy");
        let tagged = add_uuid_string(path, &uuid);

        assert_eq!(
            tagged,
            Utf8Path::new("alf/_ibl_wheel.position.257ff7ae-9ab4-35dc-bac0-245cdc81f6d1.npy")
        );
        assert_eq!(add_uuid_string(&tagged, &uuid), tagged);
        assert_eq!(remove_uuid_file(&tagged), path);
        assert_eq!(remove_uuid_file(path), path);
    }

    #[test]
    fn test_session_ref() {
        let reference: SessionRef = "2021-03-18_2_FMR_019".parse().unwrap();
        assert_eq!(reference.subject, "FMR_019");
        assert_eq!(reference.number, 2);
        assert_eq!(reference.to_string(), "2021-03-18_2_FMR_019");

        assert!("2021-03-18_FMR019".parse::<SessionRef>().is_err());
        assert!("18-03-2021_1_FMR019".parse::<SessionRef>().is_err());
        assert!("2021-03-18_1_".parse::<SessionRef>().is_err());
    }
}
