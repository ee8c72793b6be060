use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use uuid::Uuid;

use crate::config::Params;
use crate::error::ConvertError;
use crate::one::alf::{self, SessionRef};
use crate::one::cache::{Cache, DatasetRecord, SessionRecord};

/// Experiment identifier.
pub type Eid = Uuid;

/// Converts between the different ways of naming an experiment or a dataset.
///
/// Lookups only read the cache tables; nothing here touches the filesystem.
#[derive(Debug, Clone)]
pub struct Converter {
    cache: Cache,
    params: Params,
}

impl Converter {
    pub fn new(cache: Cache, params: Params) -> Self {
        Self { cache, params }
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    fn session_by_id(&self, eid: &Uuid) -> Result<Option<&SessionRecord>, ConvertError> {
        let mut found = self.cache.sessions().iter().filter(|s| s.id == *eid);
        let first = found.next();
        let rest = found.count();
        if rest > 0 {
            return Err(ConvertError::Ambiguous {
                table: "sessions",
                key: eid.to_string(),
                count: rest + 1,
            });
        }
        Ok(first)
    }

    fn session_by_ref(
        &self,
        reference: &SessionRef,
    ) -> Result<Option<&SessionRecord>, ConvertError> {
        let matches: Vec<&SessionRecord> = self
            .cache
            .sessions()
            .iter()
            .filter(|s| {
                s.subject == reference.subject
                    && s.date == reference.date
                    && s.number == reference.number
            })
            .collect();

        match matches.as_slice() {
            [] => Ok(None),
            [session] => Ok(Some(*session)),
            _ => Err(ConvertError::Ambiguous {
                table: "sessions",
                key: reference.to_string(),
                count: matches.len(),
            }),
        }
    }

    fn parse_eid(eid: &str) -> Result<Uuid, ConvertError> {
        if !alf::is_uuid_string(eid) {
            return Err(ConvertError::InvalidEid(eid.to_string()));
        }
        Uuid::try_parse(eid).map_err(|_| ConvertError::InvalidEid(eid.to_string()))
    }

    fn session_dir(&self, session: &SessionRecord) -> Utf8PathBuf {
        self.params
            .cache_dir
            .join(&session.lab)
            .join("Subjects")
            .join(&session.subject)
            .join(session.date.format("%Y-%m-%d").to_string())
            .join(format!("{:03}", session.number))
    }

    /// The experiment a local path belongs to.
    ///
    /// Only the trailing `<subject>/<date>/<number>` components of the session
    /// folder are matched; the lab and the cache root are ignored.
    pub fn eid_from_path(&self, path: impl AsRef<Utf8Path>) -> Result<Option<Eid>, ConvertError> {
        let Some(parts) = alf::parse_session(path.as_ref()) else {
            return Ok(None);
        };
        let reference = SessionRef::from_parts(&parts);
        Ok(self.session_by_ref(&reference)?.map(|s| s.id))
    }

    /// Local session folder of an experiment.
    pub fn path_from_eid(&self, eid: &str) -> Result<Option<Utf8PathBuf>, ConvertError> {
        let eid = Self::parse_eid(eid)?;
        Ok(self.session_by_id(&eid)?.map(|s| self.session_dir(s)))
    }

    /// Same as [`Converter::path_from_eid`] for an id packed as two integers.
    pub fn path_from_packed(&self, lo: i64, hi: i64) -> Result<Option<Utf8PathBuf>, ConvertError> {
        let eid = alf::ints_to_uuid([lo, hi]);
        Ok(self.session_by_id(&eid)?.map(|s| self.session_dir(s)))
    }

    /// The dataset record a local file or a remote URL points at.
    pub fn record_from_path(
        &self,
        path: impl AsRef<str>,
    ) -> Result<Option<DatasetRecord>, ConvertError> {
        let path = path.as_ref();
        let file = if path.starts_with("http") {
            alf::remove_uuid_file(path)
        } else {
            Utf8PathBuf::from(path.replace('\\', "/"))
        };

        let Some(session) = alf::session_path_of(&file) else {
            return Ok(None);
        };
        let components: Vec<&str> = session.iter().collect();
        let session_path = components[components.len().saturating_sub(5)..].join("/");

        let matches: Vec<&DatasetRecord> = self
            .cache
            .datasets()
            .iter()
            .filter(|d| d.session_path == session_path)
            .filter(|d| file.ends_with(&d.rel_path))
            .collect();

        match matches.as_slice() {
            [] => Ok(None),
            [record] => Ok(Some((*record).clone())),
            _ => Err(ConvertError::Ambiguous {
                table: "datasets",
                key: file.to_string(),
                count: matches.len(),
            }),
        }
    }

    /// Remote URL of a file in the local cache.
    pub fn url_from_path(
        &self,
        path: impl AsRef<Utf8Path>,
    ) -> Result<Option<String>, ConvertError> {
        let path = path.as_ref();
        let Some(record) = self.record_from_path(path.as_str())? else {
            return Ok(None);
        };

        let tagged = alf::add_uuid_string(path, &record.id);
        let tagged = tagged.as_str().replace('\\', "/");
        let root = self.params.cache_root();
        let root = root.trim_end_matches('/');

        match tagged.strip_prefix(root) {
            Some(rest) if rest.starts_with('/') => {
                Ok(Some(format!("{}{}", self.params.server_root(), rest)))
            }
            _ => Err(ConvertError::OutsideCache {
                path: path.to_path_buf(),
                root: self.params.cache_dir.clone(),
            }),
        }
    }

    pub fn url_from_record(&self, record: &DatasetRecord) -> String {
        let relative = alf::add_uuid_string(record.relative_file(), &record.id);
        format!("{}/{}", self.params.server_root(), relative)
    }

    pub fn path_from_record(&self, record: &DatasetRecord) -> Utf8PathBuf {
        self.params.cache_dir.join(record.relative_file())
    }

    /// Local cache path of a remote URL, or `None` when the URL is not served
    /// by the configured data server.
    pub fn path_from_url(&self, url: &str) -> Option<Utf8PathBuf> {
        let rest = url.strip_prefix(self.params.server_root())?;
        let rest = rest.strip_prefix('/')?;
        if rest.is_empty() {
            return None;
        }
        Some(self.params.cache_dir.join(alf::remove_uuid_file(rest)))
    }

    pub fn ref_from_eid(&self, eid: &str) -> Result<Option<SessionRef>, ConvertError> {
        let eid = Self::parse_eid(eid)?;
        Ok(self.session_by_id(&eid)?.map(|s| SessionRef {
            date: s.date,
            number: s.number,
            subject: s.subject.clone(),
        }))
    }

    pub fn eid_from_ref(&self, reference: &str) -> Result<Option<Eid>, ConvertError> {
        let reference: SessionRef = reference.parse()?;
        Ok(self.session_by_ref(&reference)?.map(|s| s.id))
    }

    pub fn path_from_ref(&self, reference: &str) -> Result<Option<Utf8PathBuf>, ConvertError> {
        let reference: SessionRef = reference.parse()?;
        Ok(self.session_by_ref(&reference)?.map(|s| self.session_dir(s)))
    }

    /// Reference of the session a path belongs to. Does not consult the cache.
    pub fn ref_from_path(&self, path: impl AsRef<Utf8Path>) -> Option<SessionRef> {
        alf::parse_session(path).map(|parts| SessionRef::from_parts(&parts))
    }

    pub fn eid_from_path_batch<P>(&self, paths: &[P]) -> Vec<Result<Option<Eid>, ConvertError>>
    where
        P: AsRef<Utf8Path> + Sync,
    {
        paths.par_iter().map(|p| self.eid_from_path(p)).collect()
    }

    pub fn path_from_eid_batch<S>(
        &self,
        eids: &[S],
    ) -> Vec<Result<Option<Utf8PathBuf>, ConvertError>>
    where
        S: AsRef<str> + Sync,
    {
        eids.par_iter().map(|e| self.path_from_eid(e.as_ref())).collect()
    }

    pub fn url_from_path_batch<P>(&self, paths: &[P]) -> Vec<Result<Option<String>, ConvertError>>
    where
        P: AsRef<Utf8Path> + Sync,
    {
        paths.par_iter().map(|p| self.url_from_path(p)).collect()
    }

    pub fn record_from_path_batch<S>(
        &self,
        paths: &[S],
    ) -> Vec<Result<Option<DatasetRecord>, ConvertError>>
    where
        S: AsRef<str> + Sync,
    {
        paths.par_iter().map(|p| self.record_from_path(p)).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    const EID: &str = "e7826370-21e5-3aad-ba01-4bd36d39ae3f";
    const OTHER_EID: &str = "3b5f3e7f-3f4e-4b3a-9a7e-2f5d8c1a0b6e";
    const WHEEL_ID: &str = "257ff7ae-9ab4-35dc-bac0-245cdc81f6d1";
    const WHEEL_URL: &str = "https://ibl.flatironinstitute.org/angelakilab/Subjects/FMR019/2021-03-18/002/alf/_ibl_wheel.position.257ff7ae-9ab4-35dc-bac0-245cdc81f6d1.npy";

    fn session(id: &str, subject: &str, day: u32, number: u32) -> SessionRecord {
        SessionRecord {
            id: Uuid::parse_str(id).unwrap(),
            lab: "angelakilab".into(),
            subject: subject.into(),
            date: NaiveDate::from_ymd_opt(2021, 3, day).unwrap(),
            number,
            task_protocol: None,
            project: None,
        }
    }

    fn converter() -> Converter {
        let sessions = vec![
            session(EID, "FMR008", 18, 1),
            session(OTHER_EID, "FMR019", 18, 2),
        ];
        let datasets = vec![
            DatasetRecord::new(
                Uuid::parse_str(WHEEL_ID).unwrap(),
                "angelakilab/Subjects/FMR019/2021-03-18/002",
                "alf/_ibl_wheel.position.npy",
            ),
            DatasetRecord::new(
                Uuid::parse_str("6d1e6c64-2b9a-4b8c-8f1e-0c3f3d9a7b21").unwrap(),
                "angelakilab/Subjects/FMR019/2021-03-18/002",
                "alf/_ibl_wheel.timestamps.npy",
            ),
        ];
        Converter::new(Cache::new(sessions, datasets), Params::new("/data/one"))
    }

    #[test]
    fn test_path_from_eid() {
        let one = converter();

        assert_eq!(
            one.path_from_eid(EID).unwrap().unwrap(),
            Utf8Path::new("/data/one/angelakilab/Subjects/FMR008/2021-03-18/001")
        );
        assert!(matches!(
            one.path_from_eid("fakeid"),
            Err(ConvertError::InvalidEid(id)) if id == "fakeid"
        ));
        assert_eq!(
            one.path_from_eid("00000000-0000-4000-8000-000000000000").unwrap(),
            None
        );

        let [lo, hi] = alf::uuid_to_ints(&Uuid::parse_str(EID).unwrap());
        assert_eq!(one.path_from_packed(lo, hi).unwrap(), one.path_from_eid(EID).unwrap());
    }

    #[test]
    fn test_eid_from_path() {
        let one = converter();
        let eid = Uuid::parse_str(EID).unwrap();

        let path = "/elsewhere/FMR008/2021-03-18/001/alf/_ibl_trials.table.pqt";
        assert_eq!(one.eid_from_path(path).unwrap(), Some(eid));
        assert_eq!(one.eid_from_path("/data/FMR008/2021-03-18/003").unwrap(), None);
        assert_eq!(one.eid_from_path("/data/not/a/session").unwrap(), None);

        let eids = one.eid_from_path_batch(&[
            Utf8PathBuf::from("/x/FMR008/2021-03-18/001"),
            Utf8PathBuf::from("/x/FMR008/2021-03-19/001"),
        ]);
        assert_eq!(eids.len(), 2);
        assert_eq!(eids[0].as_ref().unwrap(), &Some(eid));
        assert_eq!(eids[1].as_ref().unwrap(), &None);
    }

    #[test]
    fn test_session_path_round_trip() {
        let one = converter();

        for path in [
            "/data/one/angelakilab/Subjects/FMR008/2021-03-18/001",
            "/data/one/angelakilab/Subjects/FMR019/2021-03-18/002",
        ] {
            let eid = one.eid_from_path(path).unwrap().unwrap();
            let back = one.path_from_eid(&eid.to_string()).unwrap().unwrap();
            assert_eq!(back, Utf8Path::new(path));
        }
    }

    #[test]
    fn test_duplicate_sessions_are_ambiguous() {
        let mut sessions = converter().cache().sessions().to_vec();
        sessions.push(session(OTHER_EID, "FMR008", 18, 1));
        let one = Converter::new(Cache::new(sessions, vec![]), Params::new("/data/one"));

        assert!(matches!(
            one.eid_from_path("/x/FMR008/2021-03-18/001"),
            Err(ConvertError::Ambiguous { count: 2, .. })
        ));
    }

    #[test]
    fn test_record_and_url_from_path() {
        let one = converter();
        let file =
            "/data/one/angelakilab/Subjects/FMR019/2021-03-18/002/alf/_ibl_wheel.position.npy";

        let record = one.record_from_path(file).unwrap().unwrap();
        assert_eq!(record.id.to_string(), WHEEL_ID);
        assert_eq!(one.url_from_path(file).unwrap().as_deref(), Some(WHEEL_URL));
        assert_eq!(one.url_from_record(&record), WHEEL_URL);
        assert_eq!(one.path_from_record(&record), Utf8Path::new(file));

        let from_url = one.record_from_path(WHEEL_URL).unwrap().unwrap();
        assert_eq!(from_url, record);
        assert_eq!(one.path_from_url(WHEEL_URL).unwrap(), Utf8Path::new(file));
        assert_eq!(one.path_from_url("https://example.org/a/b.npy"), None);

        let unknown = "/data/one/angelakilab/Subjects/FMR019/2021-03-18/002/alf/spikes.times.npy";
        assert_eq!(one.url_from_path(unknown).unwrap(), None);
    }

    #[test]
    fn test_overlapping_rel_paths_are_ambiguous() {
        let session_path = "angelakilab/Subjects/FMR019/2021-03-18/002";
        let datasets = vec![
            DatasetRecord::new(Uuid::parse_str(WHEEL_ID).unwrap(), session_path, "alf/x.npy"),
            DatasetRecord::new(
                Uuid::parse_str("6d1e6c64-2b9a-4b8c-8f1e-0c3f3d9a7b21").unwrap(),
                session_path,
                "x.npy",
            ),
        ];
        let one = Converter::new(
            Cache::new(converter().cache().sessions().to_vec(), datasets),
            Params::new("/data/one"),
        );
        let file = "/data/one/angelakilab/Subjects/FMR019/2021-03-18/002/alf/x.npy";

        assert!(matches!(
            one.record_from_path(file),
            Err(ConvertError::Ambiguous { table: "datasets", count: 2, .. })
        ));
        assert!(matches!(
            one.url_from_path(file),
            Err(ConvertError::Ambiguous { table: "datasets", count: 2, .. })
        ));

        // a sibling outside alf/ only matches the bare rel_path
        let bare = "/data/one/angelakilab/Subjects/FMR019/2021-03-18/002/x.npy";
        assert_eq!(one.record_from_path(bare).unwrap().unwrap().rel_path, "x.npy");
    }

    #[test]
    fn test_url_from_path_outside_cache() {
        let one = converter();
        let file =
            "/mnt/other/angelakilab/Subjects/FMR019/2021-03-18/002/alf/_ibl_wheel.position.npy";

        assert!(matches!(
            one.url_from_path(file),
            Err(ConvertError::OutsideCache { .. })
        ));
    }

    #[test]
    fn test_refs() {
        let one = converter();
        let eid = Uuid::parse_str(EID).unwrap();

        let reference = one.ref_from_eid(EID).unwrap().unwrap();
        assert_eq!(reference.to_string(), "2021-03-18_1_FMR008");
        assert_eq!(one.eid_from_ref("2021-03-18_1_FMR008").unwrap(), Some(eid));
        assert_eq!(
            one.path_from_ref("2021-03-18_2_FMR019").unwrap().unwrap(),
            Utf8Path::new("/data/one/angelakilab/Subjects/FMR019/2021-03-18/002")
        );
        assert!(matches!(
            one.ref_from_eid("e782637021e53aadba014bd36d39ae3f"),
            Err(ConvertError::InvalidEid(_))
        ));
        assert!(matches!(
            one.eid_from_ref("FMR008"),
            Err(ConvertError::InvalidRef(_))
        ));
        assert_eq!(
            one.ref_from_path("/x/FMR008/2021-03-18/001/alf").unwrap(),
            reference
        );
    }
}
