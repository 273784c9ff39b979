use std::fmt::{Debug, Write};
use std::{borrow::Cow, panic::Location};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use strum_macros::IntoStaticStr;

/// The host is not fit to run the SDK tooling. Never retried.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentError {
    #[error("Required host tool '{binary}' was not found, install it and retry")]
    MissingBinary { binary: &'static str },
    #[error("Root privileges are required, re-run with sudo")]
    MissingRootPrivileges,
    #[error("Unsupported host architecture '{arch}', the SDK requires x86_64")]
    UnsupportedArchitecture { arch: String },
    #[error("This command must be run outside of the chroot")]
    InsideChroot,
    #[error("Failed to load configuration from '{path}'")]
    LoadConfig { path: String },
    #[error("Failed to determine the invoking user")]
    InvokingUser,
    #[error("Failed to create a private mount namespace")]
    MountNamespace,
}

/// The chroot's version file or the upgrade hooks are not in a usable state.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum VersionError {
    #[error("Chroot at '{path}' is not initialized, no version file was found")]
    Uninitialized { path: String },
    #[error("Chroot version file '{path}' contains an invalid version: '{content}'")]
    InvalidVersion { path: String, content: String },
    #[error(
        "Chroot version {version} is too old to upgrade in place (no hook for version {missing}), \
        recreate it with --replace"
    )]
    Deprecated { version: u32, missing: u32 },
    #[error(
        "Chroot version {version} is newer than the latest known version {latest}, \
        update your source checkout"
    )]
    TooNew { version: u32, latest: u32 },
    #[error("Chroot upgrade hook '{hook}' failed")]
    HookFailed { hook: String },
    #[error("Upgrade hooks '{first}' and '{second}' both claim version {version}")]
    DuplicateHook {
        version: u32,
        first: String,
        second: String,
    },
    #[error("Upgrade hook name '{name}' does not start with a version number")]
    InvalidHookName { name: String },
    #[error("Failed to read upgrade hooks from '{path}'")]
    ReadHooks { path: String },
    #[error("Failed to write chroot version file '{path}'")]
    WriteVersion { path: String },
}

/// Another user of the chroot is in the way. Retryable by the operator.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ContentionError {
    #[error(
        "Timed out after {seconds}s waiting for the chroot lock '{path}', \
        retry later or run with --force"
    )]
    LockTimeout { path: String, seconds: u64 },
    #[error("Failed to acquire the chroot lock '{path}'")]
    Lock { path: String },
    #[error("Failed to unmount '{path}', it is still in use:\n{diagnostics}")]
    MountBusy { path: String, diagnostics: String },
}

/// An external tool could not be started or finished unsuccessfully.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ToolError {
    #[error("Failed to execute '{binary}'")]
    CommandCouldNotExecute { binary: &'static str },
    #[error("'{binary}' failed: {explanation}")]
    CommandFailed {
        binary: &'static str,
        explanation: String,
    },
    #[error("Failed to parse the output of '{binary}'")]
    UnexpectedOutput { binary: &'static str },
}

/// The loopback/LVM/filesystem stack backing the chroot is not as expected.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum StorageError {
    #[error("Failed to create the backing image '{path}'")]
    BackingFile { path: String },
    #[error(
        "Device '{device}' did not appear, the volume group may not be active; \
        try 'vgchange -ay' or run with --delete"
    )]
    DeviceNodeMissing { device: String },
    #[error("Snapshot '{name}' already exists")]
    SnapshotExists { name: String },
    #[error(
        "Failed to restore snapshot '{name}', the previous chroot volume was put back in place"
    )]
    SnapshotRestore { name: String },
    #[error("Failed to remove the chroot directory '{path}'")]
    RemoveChroot { path: String },
    #[error("Snapshot '{name}' does not exist")]
    UnknownSnapshot { name: String },
    #[error("No chroot exists at '{path}', create it first")]
    MissingChroot { path: String },
    #[error("Chroot at '{path}' is not mounted")]
    NotMounted { path: String },
    #[error("Failed to read the mount table '{path}'")]
    MountTable { path: String },
    #[error("No free volume group name left for '{chroot}'")]
    VolumeGroupNames { chroot: String },
}

/// Populating a new chroot failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum SetupError {
    #[error("Chroot already contains an account named '{user}', cannot mirror the host user")]
    ReservedUser { user: String },
    #[error("Chroot group '{group}' already exists with gid {existing}, expected {gid}")]
    GroupConflict {
        group: String,
        gid: u32,
        existing: u32,
    },
    #[error("Chroot already exists at '{path}', run with --replace to recreate it")]
    AlreadyExists { path: String },
    #[error("SDK tarball '{path}' does not exist")]
    MissingTarball { path: String },
    #[error("Failed to prepare chroot files: {step}")]
    Populate { step: &'static str },
    #[error("Chroot bootstrap script failed")]
    Bootstrap,
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("Panicked: {0}")]
    Panic(String),
}

/// Each variant of `ErrorKind` is one category of failure. The set is closed so that callers can
/// decide exhaustively whether to bootstrap, recreate, retry or abort.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// The host environment is misconfigured.
    #[error(transparent)]
    Environment(#[from] EnvironmentError),

    /// Version tracking or upgrading failed.
    #[error(transparent)]
    Version(#[from] VersionError),

    /// A lock or mount is held by someone else.
    #[error(transparent)]
    Contention(#[from] ContentionError),

    /// An external tool failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The block device stack is inconsistent.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Populating a new chroot failed.
    #[error(transparent)]
    Setup(#[from] SetupError),

    /// A bug.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct SdkErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
}

pub struct SdkError(Box<SdkErrorInner>);
impl SdkError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        SdkError(Box::new(SdkErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: None,
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn with_source(kind: impl Into<ErrorKind>, source: anyhow::Error) -> Self {
        SdkError(Box::new(SdkErrorInner {
            kind: kind.into(),
            location: Location::caller(),
            source: Some(source),
            context: Vec::new(),
        }))
    }

    #[track_caller]
    pub fn internal(msg: &'static str) -> Self {
        Self::new(InternalError::Internal(msg))
    }

    #[track_caller]
    pub fn secondary_error_context(mut self, secondary: SdkError) -> Self {
        self.0.context.push((format!(
            "While handling the error, an additional error was caught: \n\n{secondary:?}\n\nThe earlier error:"
        ).into(), Location::caller()));
        self
    }

    pub fn unstructured(self, context: impl Into<Cow<'static, str>>) -> anyhow::Error {
        match self.0.source {
            Some(source) => source.context(self.0.kind).context(context.into()),
            None => anyhow::Error::from(self.0.kind).context(context.into()),
        }
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured SdkError.
    fn structured(self, kind: K) -> Result<T, SdkError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, SdkError> {
        match self {
            Some(t) => Ok(t),
            None => Err(SdkError::new(kind)),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, SdkError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(SdkError::with_source(kind, e.into())),
        }
    }
}

pub trait SdkResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, SdkError>;

    /// Convert the error into an unstructured error.
    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error>;
}

impl<T> SdkResultExt<T> for Result<T, SdkError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, SdkError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }

    fn unstructured(self, context: impl Into<Cow<'static, str>>) -> Result<T, anyhow::Error> {
        self.map_err(|e| e.unstructured(context))
    }
}

impl Serialize for SdkError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("sdk-error", 5)?;
        state.serialize_field("message", &self.0.kind.to_string())?;
        match self.0.kind {
            ErrorKind::Environment(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Version(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Contention(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Tool(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Storage(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Setup(ref e) => state.serialize_field("error", e)?,
            ErrorKind::Internal(ref e) => state.serialize_field("error", e)?,
        }
        state.serialize_field("category", <&str>::from(&self.0.kind))?;
        state.serialize_field(
            "location",
            &format!("{}:{}", self.0.location.file(), self.0.location.line()),
        )?;
        match self.0.source {
            Some(ref e) => state.serialize_field("cause", &Some(format!("{e:?}")))?,
            None => state.serialize_field("cause", &None::<String>)?,
        }
        state.end()
    }
}

impl Debug for SdkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {}:{}",
            self.0.kind,
            self.0.location.file(),
            self.0.location.line()
        )?;

        if !self.0.context.is_empty() {
            writeln!(f, "\n\nContext:")?;
            for (i, (context, location)) in self.0.context.iter().enumerate() {
                for (j, line) in context.split('\n').enumerate() {
                    if j == 0 {
                        write!(f, "{: >5}: ", i)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                writeln!(f, " at {}:{}", location.file(), location.line())?;
            }
        }

        if let Some(ref source) = self.0.source {
            writeln!(f, "\n\nCaused by:")?;
            let mut index = 0;
            let mut source: Option<&dyn std::error::Error> = Some(source.as_ref());
            while let Some(e) = source {
                for (i, line) in e.to_string().split('\n').enumerate() {
                    if i == 0 {
                        write!(f, "{: >5}: ", index)?;
                    } else {
                        f.write_str("\n       ")?;
                    }
                    f.write_str(line)?;
                }
                f.write_char('\n')?;
                source = e.source();
                index += 1;
            }
        }
        Ok(())
    }
}
