use std::fmt;

/// Metadata the host pushes ahead of a take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataField {
    TakeName,
    ShotName,
    ShotTag,
    TakeNumber,
    TakeId,
    Description,
    Notes,
    SelectTake,
    DataDirectory,
}

impl MetadataField {
    pub fn from_command(name: &str) -> Option<Self> {
        Some(match name {
            "takeName" => MetadataField::TakeName,
            "shotName" => MetadataField::ShotName,
            "shotTag" => MetadataField::ShotTag,
            "takeNumber" => MetadataField::TakeNumber,
            "takeId" => MetadataField::TakeId,
            "description" => MetadataField::Description,
            "notes" => MetadataField::Notes,
            "selectTake" => MetadataField::SelectTake,
            "set_data_directory" => MetadataField::DataDirectory,
            _ => return None,
        })
    }

    pub fn command_name(self) -> &'static str {
        match self {
            MetadataField::TakeName => "takeName",
            MetadataField::ShotName => "shotName",
            MetadataField::ShotTag => "shotTag",
            MetadataField::TakeNumber => "takeNumber",
            MetadataField::TakeId => "takeId",
            MetadataField::Description => "description",
            MetadataField::Notes => "notes",
            MetadataField::SelectTake => "selectTake",
            MetadataField::DataDirectory => "set_data_directory",
        }
    }

    /// Name-template placeholder fed by this field, if any.
    pub fn placeholder(self) -> Option<&'static str> {
        match self {
            MetadataField::TakeName => Some("take"),
            MetadataField::ShotName => Some("shot"),
            MetadataField::ShotTag => Some("tag"),
            MetadataField::TakeNumber => Some("n"),
            MetadataField::TakeId => Some("id"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotoTarget {
    Start,
    End,
}

/// A host command addressed to every enabled device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Record(String),
    Stop,
    Play(String),
    Pause(bool),
    Goto(GotoTarget),
    Metadata(MetadataField, String),
    /// Anything unrecognised. Adapters treat it as a no-op.
    Unknown { name: String, argument: String },
}

impl Command {
    pub fn parse(name: &str, argument: &str) -> Self {
        match name {
            "record" => Command::Record(argument.to_string()),
            "stop" => Command::Stop,
            "play" => Command::Play(argument.to_string()),
            "pause" => Command::Pause(matches!(argument, "on" | "1" | "true")),
            "goto" => Command::Goto(if argument == "start" {
                GotoTarget::Start
            } else {
                GotoTarget::End
            }),
            other => match MetadataField::from_command(other) {
                Some(field) => Command::Metadata(field, argument.to_string()),
                None => Command::Unknown {
                    name: name.to_string(),
                    argument: argument.to_string(),
                },
            },
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Command::Record(_) => "record",
            Command::Stop => "stop",
            Command::Play(_) => "play",
            Command::Pause(_) => "pause",
            Command::Goto(_) => "goto",
            Command::Metadata(field, _) => field.command_name(),
            Command::Unknown { name, .. } => name,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Record(take) | Command::Play(take) => write!(f, "{} {take}", self.name()),
            Command::Pause(on) => write!(f, "pause {}", if *on { "on" } else { "off" }),
            Command::Goto(GotoTarget::Start) => f.write_str("goto start"),
            Command::Goto(GotoTarget::End) => f.write_str("goto end"),
            Command::Metadata(_, value) => write!(f, "{} {value}", self.name()),
            Command::Unknown { name, argument } => write!(f, "{name} {argument}"),
            Command::Stop => f.write_str("stop"),
        }
    }
}
