//! OCPP 1.6 action catalog
//!
//! The RPC layer carries actions as plain strings so that unknown actions
//! still reach the dispatcher. This catalog only answers whether an action
//! is part of OCPP 1.6 (core profiles plus the security extension), which
//! decides between `NotSupported` and `NotImplemented` replies.

/// OCPP 1.6 action names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    // CP -> CS
    Authorize,
    BootNotification,
    DiagnosticsStatusNotification,
    FirmwareStatusNotification,
    Heartbeat,
    MeterValues,
    StartTransaction,
    StatusNotification,
    StopTransaction,

    // CS -> CP
    CancelReservation,
    ChangeAvailability,
    ChangeConfiguration,
    ClearCache,
    ClearChargingProfile,
    GetCompositeSchedule,
    GetConfiguration,
    GetDiagnostics,
    GetLocalListVersion,
    RemoteStartTransaction,
    RemoteStopTransaction,
    ReserveNow,
    Reset,
    SendLocalList,
    SetChargingProfile,
    TriggerMessage,
    UnlockConnector,
    UpdateFirmware,

    // Security extension
    CertificateSigned,
    DeleteCertificate,
    ExtendedTriggerMessage,
    GetInstalledCertificateIds,
    GetLog,
    InstallCertificate,
    LogStatusNotification,
    SecurityEventNotification,
    SignCertificate,
    SignedFirmwareStatusNotification,
    SignedUpdateFirmware,

    // Bidirectional
    DataTransfer,
}

impl Action {
    pub const ALL: [Action; 39] = [
        Action::Authorize,
        Action::BootNotification,
        Action::DiagnosticsStatusNotification,
        Action::FirmwareStatusNotification,
        Action::Heartbeat,
        Action::MeterValues,
        Action::StartTransaction,
        Action::StatusNotification,
        Action::StopTransaction,
        Action::CancelReservation,
        Action::ChangeAvailability,
        Action::ChangeConfiguration,
        Action::ClearCache,
        Action::ClearChargingProfile,
        Action::GetCompositeSchedule,
        Action::GetConfiguration,
        Action::GetDiagnostics,
        Action::GetLocalListVersion,
        Action::RemoteStartTransaction,
        Action::RemoteStopTransaction,
        Action::ReserveNow,
        Action::Reset,
        Action::SendLocalList,
        Action::SetChargingProfile,
        Action::TriggerMessage,
        Action::UnlockConnector,
        Action::UpdateFirmware,
        Action::CertificateSigned,
        Action::DeleteCertificate,
        Action::ExtendedTriggerMessage,
        Action::GetInstalledCertificateIds,
        Action::GetLog,
        Action::InstallCertificate,
        Action::LogStatusNotification,
        Action::SecurityEventNotification,
        Action::SignCertificate,
        Action::SignedFirmwareStatusNotification,
        Action::SignedUpdateFirmware,
        Action::DataTransfer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Authorize => "Authorize",
            Action::BootNotification => "BootNotification",
            Action::DiagnosticsStatusNotification => "DiagnosticsStatusNotification",
            Action::FirmwareStatusNotification => "FirmwareStatusNotification",
            Action::Heartbeat => "Heartbeat",
            Action::MeterValues => "MeterValues",
            Action::StartTransaction => "StartTransaction",
            Action::StatusNotification => "StatusNotification",
            Action::StopTransaction => "StopTransaction",
            Action::CancelReservation => "CancelReservation",
            Action::ChangeAvailability => "ChangeAvailability",
            Action::ChangeConfiguration => "ChangeConfiguration",
            Action::ClearCache => "ClearCache",
            Action::ClearChargingProfile => "ClearChargingProfile",
            Action::GetCompositeSchedule => "GetCompositeSchedule",
            Action::GetConfiguration => "GetConfiguration",
            Action::GetDiagnostics => "GetDiagnostics",
            Action::GetLocalListVersion => "GetLocalListVersion",
            Action::RemoteStartTransaction => "RemoteStartTransaction",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
            Action::ReserveNow => "ReserveNow",
            Action::Reset => "Reset",
            Action::SendLocalList => "SendLocalList",
            Action::SetChargingProfile => "SetChargingProfile",
            Action::TriggerMessage => "TriggerMessage",
            Action::UnlockConnector => "UnlockConnector",
            Action::UpdateFirmware => "UpdateFirmware",
            Action::CertificateSigned => "CertificateSigned",
            Action::DeleteCertificate => "DeleteCertificate",
            Action::ExtendedTriggerMessage => "ExtendedTriggerMessage",
            Action::GetInstalledCertificateIds => "GetInstalledCertificateIds",
            Action::GetLog => "GetLog",
            Action::InstallCertificate => "InstallCertificate",
            Action::LogStatusNotification => "LogStatusNotification",
            Action::SecurityEventNotification => "SecurityEventNotification",
            Action::SignCertificate => "SignCertificate",
            Action::SignedFirmwareStatusNotification => "SignedFirmwareStatusNotification",
            Action::SignedUpdateFirmware => "SignedUpdateFirmware",
            Action::DataTransfer => "DataTransfer",
        }
    }

    /// Whether `action` names an OCPP 1.6 action
    pub fn is_known(action: &str) -> bool {
        action.parse::<Action>().is_ok()
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .iter()
            .find(|a| a.as_str() == s)
            .copied()
            .ok_or_else(|| s.to_string())
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_roundtrip() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>(), Ok(action));
        }
    }

    #[test]
    fn test_is_known() {
        assert!(Action::is_known("Reset"));
        assert!(Action::is_known("SignedUpdateFirmware"));
        assert!(!Action::is_known("Foo"));
        // OCPP 2.0.1 only
        assert!(!Action::is_known("RequestStartTransaction"));
    }
}
