use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Every processing step a session pipeline can contain.
///
/// A pipeline never synthesizes new step types at runtime: each node carries
/// one of these tags and the runner dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    // sync
    EphysPulses,
    SyncCompress,
    SyncPulses,
    // behaviour
    PassiveRegisterRaw,
    PassiveTrials,
    TrialRegisterRaw,
    TrainingTrialsBpod,
    TrainingTrialsFpga,
    TrainingStatus,
    // ephys
    EphysCompress,
    SpikeSorting,
    EphysCellsQc,
    // video
    VideoCompress,
    VideoSyncQc,
    Dlc,
    PostDlc,
    // audio
    TrainingAudio,
    EphysAudio,
    // widefield
    WidefieldRegisterRaw,
    WidefieldCompress,
    WidefieldPreprocess,
    WidefieldSync,
    WidefieldFov,
}

/// Compute resources a step asks from the job scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: u32,
    pub gpu: u32,
    /// Relative disk load, 0 to 100.
    pub io_charge: u32,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::EphysPulses => "EphysPulses",
            TaskKind::SyncCompress => "SyncCompress",
            TaskKind::SyncPulses => "SyncPulses",
            TaskKind::PassiveRegisterRaw => "PassiveRegisterRaw",
            TaskKind::PassiveTrials => "PassiveTrials",
            TaskKind::TrialRegisterRaw => "TrialRegisterRaw",
            TaskKind::TrainingTrialsBpod => "TrainingTrialsBpod",
            TaskKind::TrainingTrialsFpga => "TrainingTrialsFPGA",
            TaskKind::TrainingStatus => "TrainingStatus",
            TaskKind::EphysCompress => "EphysMtscomp",
            TaskKind::SpikeSorting => "SpikeSorting",
            TaskKind::EphysCellsQc => "EphysCellsQc",
            TaskKind::VideoCompress => "EphysVideoCompress",
            TaskKind::VideoSyncQc => "EphysVideoSyncQc",
            TaskKind::Dlc => "EphysDLC",
            TaskKind::PostDlc => "EphysPostDLC",
            TaskKind::TrainingAudio => "TrainingAudio",
            TaskKind::EphysAudio => "EphysAudio",
            TaskKind::WidefieldRegisterRaw => "WidefieldRegisterRaw",
            TaskKind::WidefieldCompress => "WidefieldCompress",
            TaskKind::WidefieldPreprocess => "WidefieldPreprocess",
            TaskKind::WidefieldSync => "WidefieldSync",
            TaskKind::WidefieldFov => "WidefieldFOV",
        }
    }

    pub fn resources(self) -> Resources {
        match self {
            TaskKind::SpikeSorting => Resources {
                cpu: 4,
                gpu: 1,
                io_charge: 70,
            },
            TaskKind::Dlc => Resources {
                cpu: 4,
                gpu: 1,
                io_charge: 90,
            },
            TaskKind::EphysCompress | TaskKind::SyncCompress | TaskKind::WidefieldCompress => {
                Resources {
                    cpu: 2,
                    gpu: 0,
                    io_charge: 90,
                }
            }
            TaskKind::WidefieldPreprocess => Resources {
                cpu: 4,
                gpu: 0,
                io_charge: 90,
            },
            TaskKind::VideoCompress => Resources {
                cpu: 4,
                gpu: 0,
                io_charge: 100,
            },
            _ => Resources {
                cpu: 1,
                gpu: 0,
                io_charge: 20,
            },
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a session pipeline.
///
/// Parents are stored by name. The pipeline guarantees that every listed
/// parent exists and was inserted before this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNode {
    pub name: String,
    pub kind: TaskKind,
    pub session_path: Utf8PathBuf,
    pub runtime_args: BTreeMap<String, String>,
    pub parents: Vec<String>,
}

impl TaskNode {
    pub fn new(
        name: impl Into<String>,
        kind: TaskKind,
        session_path: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            session_path: session_path.into(),
            runtime_args: BTreeMap::new(),
            parents: Vec::new(),
        }
    }

    pub fn arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.runtime_args.insert(key.to_string(), value.into());
        self
    }

    pub fn get_arg(&self, key: &str) -> Option<&str> {
        self.runtime_args.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_steps() {
        let gpu: Vec<_> = [
            TaskKind::SpikeSorting,
            TaskKind::Dlc,
            TaskKind::VideoCompress,
            TaskKind::TrainingStatus,
        ]
        .into_iter()
        .filter(|kind| kind.resources().gpu > 0)
        .collect();

        assert_eq!(gpu, [TaskKind::SpikeSorting, TaskKind::Dlc]);
    }

    #[test]
    fn test_node_args() {
        let node = TaskNode::new("Compression_probe00", TaskKind::EphysCompress, "/data/s")
            .arg("pname", "probe00");

        assert_eq!(node.get_arg("pname"), Some("probe00"));
        assert_eq!(node.get_arg("protocol"), None);
        assert!(node.parents.is_empty());
        assert_eq!(node.kind.to_string(), "EphysMtscomp");
    }
}
