use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Attributes of one acquired data stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    /// Session-relative folder holding the raw files of this stream.
    pub collection: String,
    /// Name of the sync channel this stream is timed against, if any.
    #[serde(default)]
    pub sync_label: Option<String>,
    /// Marks the main behaviour protocol of a session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<bool>,
    /// File extension of the raw sync files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

impl Stream {
    pub fn new(collection: impl Into<String>, sync_label: Option<&str>) -> Self {
        Self {
            collection: collection.into(),
            sync_label: sync_label.map(str::to_string),
            main: None,
            extension: None,
        }
    }

    fn main(mut self, main: bool) -> Self {
        self.main = Some(main);
        self
    }

    fn extension(mut self, extension: &str) -> Self {
        self.extension = Some(extension.to_string());
        self
    }
}

/// Stream name to attributes, in declaration order.
///
/// Order matters: behaviour protocols produce their tasks in the order they are
/// listed, so this is a vector of pairs rather than a hash map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Streams(Vec<(String, Stream)>);

impl Streams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, stream: Stream) -> Self {
        self.insert(name, stream);
        self
    }

    /// Insert or replace a stream. Replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, stream: Stream) {
        let name = name.into();
        match self.0.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => *slot = stream,
            None => self.0.push((name, stream)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Stream> {
        self.0.iter().find(|(key, _)| key == name).map(|(_, s)| s)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Stream)> {
        self.0.iter().map(|(name, stream)| (name.as_str(), stream))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Streams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, stream) in &self.0 {
            map.serialize_entry(name, stream)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Streams {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StreamsVisitor;

        impl<'de> Visitor<'de> for StreamsVisitor {
            type Value = Streams;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of stream names to stream attributes")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Streams, A::Error> {
                let mut streams = Streams(Vec::with_capacity(access.size_hint().unwrap_or(0)));
                while let Some((name, stream)) = access.next_entry::<String, Stream>()? {
                    streams.insert(name, stream);
                }
                Ok(streams)
            }
        }

        deserializer.deserialize_map(StreamsVisitor)
    }
}

/// Declarative description of the data streams acquired in a session.
///
/// Each modality is optional; absent modalities produce no tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cameras: Option<Streams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neuropixel: Option<Streams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microphone: Option<Streams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Streams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<Streams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widefield: Option<Streams>,
}

impl AcquisitionDescription {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Canned descriptions for the choice world experiments.
    ///
    /// `choice_world_recording` is the canonical three camera, two probe ephys
    /// rig. Any other name gets the single camera training rig with `experiment`
    /// as its main protocol.
    pub fn for_experiment(experiment: &str) -> Self {
        let bpod_sync = Streams::new().with(
            "bpod",
            Stream::new("raw_behavior_data", None).extension(".bin"),
        );
        let microphone =
            Streams::new().with("harp", Stream::new("raw_behavior_data", None));

        if experiment == "choice_world_recording" {
            let video = || Stream::new("raw_video_data", Some("frame2ttl"));
            Self {
                cameras: Some(
                    Streams::new()
                        .with("right", video())
                        .with("body", video())
                        .with("left", video()),
                ),
                neuropixel: Some(
                    Streams::new()
                        .with(
                            "probe00",
                            Stream::new("raw_ephys_data/probe00", Some("imec_sync")),
                        )
                        .with(
                            "probe01",
                            Stream::new("raw_ephys_data/probe01", Some("imec_sync")),
                        ),
                ),
                microphone: Some(microphone),
                tasks: Some(
                    Streams::new()
                        .with(
                            "choice_world_training",
                            Stream::new("raw_behavior_data", Some("bpod")).main(true),
                        )
                        .with(
                            "passive_world_training",
                            Stream::new("raw_passive_data", Some("bpod")).main(false),
                        ),
                ),
                sync: Some(bpod_sync),
                widefield: None,
            }
        } else {
            Self {
                cameras: Some(
                    Streams::new().with("left", Stream::new("raw_video_data", Some("frame2ttl"))),
                ),
                neuropixel: None,
                microphone: Some(microphone),
                tasks: Some(Streams::new().with(
                    experiment,
                    Stream::new("raw_behavior_data", Some("bpod")).main(true),
                )),
                sync: Some(bpod_sync),
                widefield: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streams_keep_declaration_order() {
        let json = r#"{
            "tasks": {
                "zeta_protocol": {"collection": "raw_behavior_data", "sync_label": "bpod"},
                "alpha_protocol": {"collection": "raw_passive_data", "sync_label": null}
            }
        }"#;

        let description = AcquisitionDescription::from_json(json).unwrap();
        let names: Vec<_> = description
            .tasks
            .as_ref()
            .unwrap()
            .iter()
            .map(|(name, _)| name)
            .collect();

        assert_eq!(names, ["zeta_protocol", "alpha_protocol"]);
        assert!(description.cameras.is_none());
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut streams = Streams::new()
            .with("a", Stream::new("one", None))
            .with("b", Stream::new("two", None));
        streams.insert("a", Stream::new("three", None));

        let collections: Vec<_> = streams.iter().map(|(_, s)| s.collection.as_str()).collect();
        assert_eq!(collections, ["three", "two"]);
    }

    #[test]
    fn test_json_roundtrip_of_recording_rig() {
        let description = AcquisitionDescription::for_experiment("choice_world_recording");
        let json = description.to_json().unwrap();
        assert_eq!(AcquisitionDescription::from_json(&json).unwrap(), description);
    }

    #[test]
    fn test_training_rig_uses_experiment_as_protocol() {
        let description = AcquisitionDescription::for_experiment("choice_world_biased");
        let tasks = description.tasks.unwrap();

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks.get("choice_world_biased").unwrap().main, Some(true));
        assert!(description.neuropixel.is_none());
        assert!(description.sync.unwrap().get("bpod").is_some());
    }
}
