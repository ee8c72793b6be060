use std::fs;
use std::sync::Mutex;

use camino::Utf8PathBuf;
use ibl_pipes::pipeline::{Stream, Streams, TaskStatus};
use ibl_pipes::{
    AcquisitionDescription, Cache, Converter, Fetcher, LocalBucket, Params, TaskKind, TaskNode,
    make_pipeline,
};

const SESSIONS: &str = "\
id,lab,subject,date,number,task_protocol
e7826370-21e5-3aad-ba01-4bd36d39ae3f,angelakilab,FMR008,2021-03-18,1,ephysChoiceWorld
";

const DATASETS: &str = "\
id,eid,session_path,rel_path,exists
257ff7ae-9ab4-35dc-bac0-245cdc81f6d1,e7826370-21e5-3aad-ba01-4bd36d39ae3f,angelakilab/Subjects/FMR008/2021-03-18/001,alf/_ibl_wheel.position.npy,False
";

fn utf8(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap()
}

#[test]
fn recording_session_end_to_end() {
    let cache_dir = tempfile::tempdir().unwrap();
    let bucket_dir = tempfile::tempdir().unwrap();
    fs::write(cache_dir.path().join("sessions.csv"), SESSIONS).unwrap();
    fs::write(cache_dir.path().join("datasets.csv"), DATASETS).unwrap();

    let params = Params::new(utf8(&cache_dir));
    let one = Converter::new(Cache::load(utf8(&cache_dir)).unwrap(), params.clone());

    // the session folder comes from the cache tables
    let session = one
        .path_from_eid("e7826370-21e5-3aad-ba01-4bd36d39ae3f")
        .unwrap()
        .unwrap();
    assert!(session.ends_with("angelakilab/Subjects/FMR008/2021-03-18/001"));

    // bring the missing wheel dataset in from the bucket
    let bucket = LocalBucket::new(utf8(&bucket_dir));
    let fetcher = Fetcher::new(&bucket, &params);
    let missing = one.cache().missing_datasets();
    let key = fetcher.remote_key(&missing[0]);
    let remote = utf8(&bucket_dir).join(&key);
    fs::create_dir_all(remote.parent().unwrap()).unwrap();
    fs::write(&remote, "wheel").unwrap();

    let report = fetcher.download_datasets(&missing).unwrap();
    assert_eq!(report.downloaded.len(), 1);
    let wheel = &report.downloaded[0];
    assert_eq!(one.eid_from_path(wheel).unwrap(), Some(missing[0].eid.unwrap()));
    assert!(one.url_from_path(wheel).unwrap().unwrap().ends_with(
        "FMR008/2021-03-18/001/alf/_ibl_wheel.position.257ff7ae-9ab4-35dc-bac0-245cdc81f6d1.npy"
    ));

    // then process the session
    let mut description = AcquisitionDescription::for_experiment("choice_world_recording");
    description.sync = Some(Streams::new().with("nidq", Stream::new("raw_ephys_data", None)));
    let pipeline = make_pipeline(&description, &session).unwrap();
    assert_eq!(pipeline.session_path(), session.as_path());

    let ran = Mutex::new(Vec::new());
    let report = pipeline
        .run(&|task: &TaskNode| {
            ran.lock().unwrap().push(task.name.clone());
            if task.kind == TaskKind::SpikeSorting && task.name.ends_with("probe01") {
                anyhow::bail!("kilosort crashed");
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(report.statuses.len(), pipeline.len());
    assert!(matches!(report.status("SpikeSorting_probe01"), Some(TaskStatus::Errored(_))));
    assert_eq!(
        report.status("CellsQC_probe01"),
        Some(&TaskStatus::Skipped {
            parent: "SpikeSorting_probe01".into()
        })
    );
    assert_eq!(report.status("CellsQC_probe00"), Some(&TaskStatus::Complete));
    assert!(!ran.lock().unwrap().contains(&"CellsQC_probe01".to_string()));
}
