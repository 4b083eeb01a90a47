use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::digest::Sha256Digest;
use crate::payload::validate_version;
use crate::{ProtoError, ProtoResult};

/// Instruction handed back to an agent, either as the direct reply to its
/// request or, for idle polls, as a task from its backlog.
///
/// On the wire every command is `{"Command": <name>, "Arguments": <object|null>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireCommand", into = "WireCommand")]
pub enum ResponseToAgent {
    SetSystemUuid { system_uuid: Uuid },
    GetFileByHash { sha256: Sha256Digest },
    GetCatalogFileByHash { sha256: Sha256Digest },
    Update { new_version: String },
    /// Back-off signal for when the server is overloaded.
    Stall,
    Nop,
    Success,
}

/// Untyped envelope used for (de)serialisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireCommand {
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "Arguments", default)]
    pub arguments: Value,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SystemUuidArgs {
    #[serde(rename = "SystemUUID")]
    system_uuid: String,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct HashArgs {
    #[serde(rename = "Sha256")]
    sha256: String,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateArgs {
    #[serde(rename = "NewVersion")]
    new_version: String,
}

impl ResponseToAgent {
    pub const SET_SYSTEM_UUID: &'static str = "SetSystemUUID";
    pub const GET_FILE_BY_HASH: &'static str = "GetFileByHash";
    pub const GET_CATALOG_FILE_BY_HASH: &'static str = "GetCatalogFileByHash";
    pub const UPDATE: &'static str = "Update";
    pub const STALL: &'static str = "Stall";
    pub const NOP: &'static str = "NOP";
    pub const SUCCESS: &'static str = "Success";

    pub fn name(&self) -> &'static str {
        match self {
            ResponseToAgent::SetSystemUuid { .. } => Self::SET_SYSTEM_UUID,
            ResponseToAgent::GetFileByHash { .. } => Self::GET_FILE_BY_HASH,
            ResponseToAgent::GetCatalogFileByHash { .. } => Self::GET_CATALOG_FILE_BY_HASH,
            ResponseToAgent::Update { .. } => Self::UPDATE,
            ResponseToAgent::Stall => Self::STALL,
            ResponseToAgent::Nop => Self::NOP,
            ResponseToAgent::Success => Self::SUCCESS,
        }
    }

    /// Only an idle reply may be replaced by a pending task.
    pub fn is_nop(&self) -> bool {
        matches!(self, ResponseToAgent::Nop)
    }

    pub fn encode(&self) -> ProtoResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> ProtoResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    fn arguments(&self) -> Value {
        let args = match self {
            ResponseToAgent::SetSystemUuid { system_uuid } => serde_json::to_value(SystemUuidArgs {
                system_uuid: system_uuid.hyphenated().to_string(),
            }),
            ResponseToAgent::GetFileByHash { sha256 }
            | ResponseToAgent::GetCatalogFileByHash { sha256 } => {
                serde_json::to_value(HashArgs {
                    sha256: sha256.to_hex(),
                })
            }
            ResponseToAgent::Update { new_version } => serde_json::to_value(UpdateArgs {
                new_version: new_version.clone(),
            }),
            ResponseToAgent::Stall | ResponseToAgent::Nop | ResponseToAgent::Success => {
                return Value::Null
            }
        };
        // Plain string fields always serialise.
        args.unwrap_or(Value::Null)
    }
}

impl From<ResponseToAgent> for WireCommand {
    fn from(response: ResponseToAgent) -> Self {
        WireCommand {
            command: response.name().to_string(),
            arguments: response.arguments(),
        }
    }
}

impl TryFrom<WireCommand> for ResponseToAgent {
    type Error = ProtoError;

    fn try_from(wire: WireCommand) -> Result<Self, Self::Error> {
        let WireCommand { command, arguments } = wire;
        let invalid = |reason: String| ProtoError::InvalidArguments {
            command: command.clone(),
            reason,
        };

        match command.as_str() {
            Self::SET_SYSTEM_UUID => {
                let args: SystemUuidArgs =
                    serde_json::from_value(arguments).map_err(|err| invalid(err.to_string()))?;
                let system_uuid =
                    Uuid::parse_str(&args.system_uuid).map_err(|err| invalid(err.to_string()))?;
                Ok(ResponseToAgent::SetSystemUuid { system_uuid })
            }
            Self::GET_FILE_BY_HASH | Self::GET_CATALOG_FILE_BY_HASH => {
                let args: HashArgs =
                    serde_json::from_value(arguments).map_err(|err| invalid(err.to_string()))?;
                let sha256 = Sha256Digest::parse_upload_name(&args.sha256)
                    .map_err(|err| invalid(err.to_string()))?;
                if command == Self::GET_FILE_BY_HASH {
                    Ok(ResponseToAgent::GetFileByHash { sha256 })
                } else {
                    Ok(ResponseToAgent::GetCatalogFileByHash { sha256 })
                }
            }
            Self::UPDATE => {
                let args: UpdateArgs =
                    serde_json::from_value(arguments).map_err(|err| invalid(err.to_string()))?;
                validate_version(&args.new_version).map_err(|err| invalid(err.to_string()))?;
                Ok(ResponseToAgent::Update {
                    new_version: args.new_version,
                })
            }
            Self::STALL | Self::NOP | Self::SUCCESS => {
                let empty = match &arguments {
                    Value::Null => true,
                    Value::Object(map) => map.is_empty(),
                    _ => false,
                };
                if !empty {
                    return Err(invalid("takes no arguments".to_string()));
                }
                Ok(match command.as_str() {
                    Self::STALL => ResponseToAgent::Stall,
                    Self::NOP => ResponseToAgent::Nop,
                    _ => ResponseToAgent::Success,
                })
            }
            _ => Err(ProtoError::UnknownCommand(command.clone())),
        }
    }
}
