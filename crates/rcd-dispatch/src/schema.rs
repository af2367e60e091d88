//! Declarative command parameter schemas
//!
//! Every supported command has a table of parameters it accepts. A parameter
//! is a name plus a [`ParamKind`] describing which JSON values are legal and
//! how they are rendered on the command line. One generic validator walks a
//! caller's preferences against the table.

use chrono::{NaiveTime, Timelike};
use serde_json::{Map, Value};

use crate::error::{DispatchError, Result};

/// Legal `(code, label)` pairs of an enumerated parameter
pub type Choices = &'static [(i64, &'static str)];

pub const SCAN_DIRECTION: Choices = &[(0, "Both"), (1, "Incoming"), (2, "Outcoming")];

pub const SCAN_TYPE_PREF: Choices = &[(1, "QuickScan"), (2, "FullScan")];

pub const MAPS_REPORTING: Choices = &[(0, "Disabled"), (1, "Basic"), (2, "Advanced")];

pub const SUBMIT_SAMPLES_CONSENT: Choices = &[
    (0, "AlwaysPrompt"),
    (1, "SendSafeSamples"),
    (2, "NeverSend"),
    (3, "SendAllSamples"),
];

pub const THREAT_ACTION: Choices = &[
    (1, "Clean"),
    (2, "Quarantine"),
    (3, "Remove"),
    (6, "Allow"),
    (8, "UserDefined"),
    (9, "NoAction"),
    (10, "Block"),
];

pub const PUA_PROTECTION: Choices = &[(0, "Disabled"), (1, "Enabled"), (2, "AuditMode")];

pub const UPDATES_CHANNEL: Choices = &[
    (0, "NotConfigured"),
    (2, "Beta"),
    (3, "Preview"),
    (4, "Staged"),
    (5, "Broad"),
];

pub const DEFINITION_UPDATES_CHANNEL: Choices = &[(0, "NotConfigured"), (4, "Staged"), (5, "Broad")];

pub const DAY: Choices = &[
    (0, "Everyday"),
    (1, "Sunday"),
    (2, "Monday"),
    (3, "Tuesday"),
    (4, "Wednesday"),
    (5, "Thursday"),
    (6, "Friday"),
    (7, "Saturday"),
    (8, "Never"),
];

pub const SCAN_TYPE: Choices = &[(1, "FullScan"), (2, "QuickScan"), (3, "CustomScan")];

pub const UPDATE_SOURCE: Choices = &[
    (0, "InternalDefinitionUpdateServer"),
    (1, "MicrosoftUpdateServer"),
    (2, "MMPC"),
    (3, "FileShares"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Text,
    Integer,
    Boolean,
    /// Time of day, rendered `HH:MM:SS`
    Time,
    /// Switch parameter; any supplied value renders empty
    Flag,
    Choice(Choices),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: &'static str,
    pub kind: ParamKind,
}

const fn param(name: &'static str, kind: ParamKind) -> Param {
    Param { name, kind }
}

use ParamKind::{Boolean, Flag, Integer, Text, Time};

/// Parameters every command accepts
pub const COMMON: &[Param] = &[
    param("CimSession", Text),
    param("ThrottleLimit", Integer),
    param("AsJob", Flag),
];

const SET_PREFERENCE: &[Param] = &[
    param("ExclusionPath", Text),
    param("ExclusionExtension", Text),
    param("ExclusionProcess", Text),
    param("RealTimeScanDirection", ParamKind::Choice(SCAN_DIRECTION)),
    param("QuarantinePurgeItemsAfterDelay", Integer),
    param("RemediationScheduleDay", ParamKind::Choice(DAY)),
    param("RemediationScheduleTime", Time),
    param("ReportingAdditionalActionTimeOut", Integer),
    param("ReportingCriticalFailureTimeOut", Integer),
    param("ReportingNonCriticalTimeOut", Integer),
    param("ScanAvgCPULoadFactor", Integer),
    param("CheckForSignaturesBeforeRunningScan", Boolean),
    param("ScanPurgeItemsAfterDelay", Integer),
    param("ScanOnlyIfIdleEnabled", Boolean),
    param("ScanParameters", ParamKind::Choice(SCAN_TYPE_PREF)),
    param("ScanScheduleDay", ParamKind::Choice(DAY)),
    param("ScanScheduleQuickScanTime", Time),
    param("ScanScheduleTime", Time),
    param("SignatureFirstAuGracePeriod", Integer),
    param("SignatureAuGracePeriod", Integer),
    param("SignatureDefinitionUpdateFileSharesSources", Text),
    param("SignatureDisableUpdateOnStartupWithoutEngine", Boolean),
    param("SignatureFallbackOrder", Text),
    param("SignatureScheduleDay", ParamKind::Choice(DAY)),
    param("SignatureScheduleTime", Time),
    param("SignatureUpdateCatchupInterval", Integer),
    param("SignatureUpdateInterval", Integer),
    param("MAPSReporting", ParamKind::Choice(MAPS_REPORTING)),
    param("SubmitSamplesConsent", ParamKind::Choice(SUBMIT_SAMPLES_CONSENT)),
    param("DisableAutoExclusions", Boolean),
    param("DisablePrivacyMode", Boolean),
    param("RandomizeScheduleTaskTimes", Boolean),
    param("DisableBehaviorMonitoring", Boolean),
    param("DisableIOAVProtection", Boolean),
    param("DisableRealtimeMonitoring", Boolean),
    param("DisableScriptScanning", Boolean),
    param("DisableArchiveScanning", Boolean),
    param("DisableCatchupFullScan", Boolean),
    param("DisableCatchupQuickScan", Boolean),
    param("DisableCpuThrottleOnIdleScans", Boolean),
    param("DisableEmailScanning", Boolean),
    param("DisableRemovableDriveScanning", Boolean),
    param("DisableRestorePoint", Boolean),
    param("DisableScanningMappedNetworkDrivesForFullScan", Boolean),
    param("DisableScanningNetworkFiles", Boolean),
    param("UILockdown", Boolean),
    param("ThreatIDDefaultAction_Ids", Integer),
    param("ThreatIDDefaultAction_Actions", ParamKind::Choice(THREAT_ACTION)),
    param("UnknownThreatDefaultAction", ParamKind::Choice(THREAT_ACTION)),
    param("LowThreatDefaultAction", ParamKind::Choice(THREAT_ACTION)),
    param("ModerateThreatDefaultAction", ParamKind::Choice(THREAT_ACTION)),
    param("HighThreatDefaultAction", ParamKind::Choice(THREAT_ACTION)),
    param("SevereThreatDefaultAction", ParamKind::Choice(THREAT_ACTION)),
    param("DisableBlockAtFirstSeen", Boolean),
    param("PUAProtection", ParamKind::Choice(PUA_PROTECTION)),
    param("DefinitionUpdatesChannel", ParamKind::Choice(DEFINITION_UPDATES_CHANNEL)),
    param("EngineUpdatesChannel", ParamKind::Choice(UPDATES_CHANNEL)),
    param("PlatformUpdatesChannel", ParamKind::Choice(UPDATES_CHANNEL)),
];

const START_SCAN: &[Param] = &[
    param("ScanPath", Text),
    param("ScanTypePref", ParamKind::Choice(SCAN_TYPE)),
];

const UPDATE_SIGNATURE: &[Param] = &[param("UpdateSource", ParamKind::Choice(UPDATE_SOURCE))];

/// Parameter table of one command: the common parameters, then its own
#[derive(Debug)]
pub struct Schema {
    specific: &'static [Param],
}

pub static SET_PREFERENCE_SCHEMA: Schema = Schema::new(SET_PREFERENCE);
pub static START_SCAN_SCHEMA: Schema = Schema::new(START_SCAN);
pub static UPDATE_SIGNATURE_SCHEMA: Schema = Schema::new(UPDATE_SIGNATURE);
pub static COMMON_SCHEMA: Schema = Schema::new(&[]);

/// One validated `-Name value` pair, ready for the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandArg {
    pub name: &'static str,
    pub value: String,
}

impl Schema {
    pub const fn new(specific: &'static [Param]) -> Self {
        Self { specific }
    }

    pub fn params(&self) -> impl Iterator<Item = &'static Param> {
        COMMON.iter().chain(self.specific.iter())
    }

    pub fn find(&self, name: &str) -> Option<&'static Param> {
        self.params().find(|p| p.name == name)
    }

    /// Validate `preferences` and render them in the caller's order.
    ///
    /// Unknown names are rejected. `null` values count as not supplied and
    /// are skipped.
    pub fn validate(&self, command: &str, preferences: &Map<String, Value>) -> Result<Vec<CommandArg>> {
        let mut args = Vec::with_capacity(preferences.len());

        for (name, value) in preferences {
            let param = self.find(name).ok_or_else(|| DispatchError::UnknownPreference {
                event: command.to_string(),
                name: name.clone(),
            })?;

            if value.is_null() {
                continue;
            }

            let value = render(param.kind, value).map_err(|reason| DispatchError::InvalidPreference {
                name: name.clone(),
                reason,
            })?;
            args.push(CommandArg {
                name: param.name,
                value,
            });
        }

        Ok(args)
    }
}

fn render(kind: ParamKind, value: &Value) -> std::result::Result<String, String> {
    match kind {
        ParamKind::Text => match value {
            Value::String(s) => Ok(quote_text(s)),
            Value::Number(n) => Ok(quote_text(&n.to_string())),
            other => Err(format!("expected a string, got {}", other)),
        },
        ParamKind::Integer => as_integer(value)
            .map(|n| n.to_string())
            .ok_or_else(|| format!("expected an integer, got {}", value)),
        ParamKind::Boolean => as_bool(value)
            .map(|b| if b { "$True" } else { "$False" }.to_string())
            .ok_or_else(|| format!("expected a boolean, got {}", value)),
        ParamKind::Time => as_time(value)
            .map(|t| t.format("%H:%M:%S").to_string())
            .ok_or_else(|| format!("expected a time of day, got {}", value)),
        ParamKind::Flag => Ok(String::new()),
        ParamKind::Choice(choices) => as_choice(choices, value).ok_or_else(|| {
            let acceptable: Vec<String> = choices
                .iter()
                .map(|(code, label)| format!("{} ({})", code, label))
                .collect();
            format!("Wrong value. Acceptable values are: {}", acceptable.join(", "))
        }),
    }
}

/// Single-quote text for the script block, `'` doubled. Comma-separated
/// items stay separate array elements.
fn quote_text(text: &str) -> String {
    text.split(',')
        .map(|item| format!("'{}'", item.trim().replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(",")
}

fn as_integer(value: &Value) -> Option<i64> {
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive
    const I64_RANGE: std::ops::Range<f64> = (i64::MIN as f64)..(i64::MAX as f64);

    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && I64_RANGE.contains(f))
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "on" | "t" | "true" | "y" | "yes" => Some(true),
            "0" | "off" | "f" | "false" | "n" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_time(value: &Value) -> Option<NaiveTime> {
    let time = match value {
        Value::String(s) => {
            let s = s.trim();
            NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
                .ok()
        }
        Value::Number(n) => {
            let secs = u32::try_from(n.as_u64()?).ok()?;
            NaiveTime::from_num_seconds_from_midnight_opt(secs, 0)
        }
        _ => None,
    };
    time.map(|t| t.with_nanosecond(0).unwrap_or(t))
}

/// A choice is accepted by code (number or numeric string) or by label and
/// passed through as given
fn as_choice(choices: Choices, value: &Value) -> Option<String> {
    match value {
        Value::Number(_) => {
            let code = as_integer(value)?;
            choices.iter().any(|(c, _)| *c == code).then(|| code.to_string())
        }
        Value::String(s) => {
            if choices.iter().any(|(_, label)| label == s) {
                return Some(s.clone());
            }
            let code: i64 = s.trim().parse().ok()?;
            choices.iter().any(|(c, _)| *c == code).then(|| code.to_string())
        }
        _ => None,
    }
}
