//! Supported remote commands
//!
//! The inbound `event` string is resolved once, at decode time, into an
//! [`Event`]. Everything that varies by command (parameter schema, result
//! route, fields to parse out of the output) hangs off the enum.

use rcd_config::RouteRole;
use std::fmt;
use std::str::FromStr;

use crate::error::DispatchError;
use crate::schema::{
    Schema, COMMON_SCHEMA, SET_PREFERENCE_SCHEMA, START_SCAN_SCHEMA, UPDATE_SIGNATURE_SCHEMA,
};

/// Fields reported for `Get-MpComputerStatus`, in output order
pub const STATUS_FIELDS: &[&str] = &[
    "AntivirusSignatureLastUpdated",
    "AntivirusSignatureVersion",
    "AntivirusEnabled",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    SetPreference,
    StartScan,
    UpdateSignature,
    GetPreference,
    GetComputerStatus,
}

impl Event {
    pub const ALL: [Event; 5] = [
        Event::SetPreference,
        Event::StartScan,
        Event::UpdateSignature,
        Event::GetPreference,
        Event::GetComputerStatus,
    ];

    /// Command name as invoked on the remote host
    pub fn command(&self) -> &'static str {
        match self {
            Event::SetPreference => "Set-MpPreference",
            Event::StartScan => "Start-MpScan",
            Event::UpdateSignature => "Update-MpSignature",
            Event::GetPreference => "Get-MpPreference",
            Event::GetComputerStatus => "Get-MpComputerStatus",
        }
    }

    pub fn schema(&self) -> &'static Schema {
        match self {
            Event::SetPreference => &SET_PREFERENCE_SCHEMA,
            Event::StartScan => &START_SCAN_SCHEMA,
            Event::UpdateSignature => &UPDATE_SIGNATURE_SCHEMA,
            Event::GetPreference | Event::GetComputerStatus => &COMMON_SCHEMA,
        }
    }

    /// Route that receives the parsed output, if the command reports any
    pub fn result_role(&self) -> Option<RouteRole> {
        match self {
            Event::GetPreference => Some(RouteRole::SettingsResult),
            Event::GetComputerStatus => Some(RouteRole::StatusResult),
            _ => None,
        }
    }

    /// Fields the output parser looks for, in report order
    pub fn report_fields(&self) -> Vec<&'static str> {
        match self {
            Event::GetPreference => SET_PREFERENCE_SCHEMA.params().map(|p| p.name).collect(),
            Event::GetComputerStatus => STATUS_FIELDS.to_vec(),
            _ => Vec::new(),
        }
    }
}

impl FromStr for Event {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Event::ALL
            .into_iter()
            .find(|e| e.command() == s)
            .ok_or_else(|| DispatchError::UnknownEvent(s.to_string()))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_command_names() {
        for event in Event::ALL {
            assert_eq!(event.command().parse::<Event>().unwrap(), event);
        }
        assert!(matches!(
            "Get-MpThreat".parse::<Event>(),
            Err(DispatchError::UnknownEvent(ref e)) if e == "Get-MpThreat"
        ));
        assert!("get-mppreference".parse::<Event>().is_err());
    }

    #[test]
    fn test_result_routing() {
        assert_eq!(Event::GetPreference.result_role(), Some(RouteRole::SettingsResult));
        assert_eq!(Event::GetComputerStatus.result_role(), Some(RouteRole::StatusResult));
        assert_eq!(Event::SetPreference.result_role(), None);
        assert_eq!(Event::StartScan.result_role(), None);
        assert_eq!(Event::UpdateSignature.result_role(), None);
    }

    #[test]
    fn test_report_fields() {
        let prefs = Event::GetPreference.report_fields();
        assert_eq!(prefs.len(), 61);
        assert_eq!(&prefs[..3], &["CimSession", "ThrottleLimit", "AsJob"]);
        assert_eq!(prefs.last(), Some(&"PlatformUpdatesChannel"));
        assert_eq!(Event::GetComputerStatus.report_fields(), STATUS_FIELDS);
        assert!(Event::StartScan.report_fields().is_empty());
    }

    #[test]
    fn test_get_events_accept_common_parameters_only() {
        assert!(Event::GetPreference.schema().find("ThrottleLimit").is_some());
        assert!(Event::GetComputerStatus.schema().find("ScanPath").is_none());
        assert!(Event::StartScan.schema().find("ScanPath").is_some());
    }
}
