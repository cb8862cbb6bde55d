//! Core protocol types for TWAIN session management
//!
//! Defines the session state ladder, protocol result codes, triplet
//! identifiers, and the `repr(C)` structures that cross the native
//! manager boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// TWAIN session state ladder.
///
/// States are totally ordered; every protocol operation declares the
/// range of states it is legal in and the session refuses calls made
/// outside that range before anything reaches the native manager.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum State {
    /// Bookkeeping was forcibly torn down; nothing is legal here.
    Invalid = 0,
    /// No manager connection. Sessions start and end here.
    DsmUnloaded = 1,
    /// Manager library present but not opened for this session.
    DsmLoaded = 2,
    /// Manager opened; sources can be enumerated and opened.
    DsmOpened = 3,
    /// A source is open and capabilities can be negotiated.
    SourceOpened = 4,
    /// The source is enabled and may start acquiring.
    SourceEnabled = 5,
    /// The source announced a pending transfer.
    TransferReady = 6,
    /// A transfer is in progress.
    Transferring = 7,
}

/// Result code returned by every native manager call.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnCode {
    Success = 0,
    Failure = 1,
    /// Operation worked but with caveats; query status for detail.
    CheckStatus = 2,
    Cancel = 3,
    DsEvent = 4,
    NotDsEvent = 5,
    XferDone = 6,
    EndOfList = 7,
    InfoNotSupported = 8,
    DataNotAvailable = 9,
    Busy = 10,
    ScannerLocked = 11,
}

impl ReturnCode {
    /// Maps a raw code from the native boundary. Codes outside the
    /// published set are treated as plain failures.
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0 => Self::Success,
            1 => Self::Failure,
            2 => Self::CheckStatus,
            3 => Self::Cancel,
            4 => Self::DsEvent,
            5 => Self::NotDsEvent,
            6 => Self::XferDone,
            7 => Self::EndOfList,
            8 => Self::InfoNotSupported,
            9 => Self::DataNotAvailable,
            10 => Self::Busy,
            11 => Self::ScannerLocked,
            _ => Self::Failure,
        }
    }
}

/// Condition code produced by the separate status query after a
/// non-success return code.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionCode {
    Success = 0,
    Bummer = 1,
    LowMemory = 2,
    NoDs = 3,
    MaxConnections = 4,
    OperationError = 5,
    BadCap = 6,
    BadProtocol = 9,
    BadValue = 10,
    SeqError = 11,
    BadDest = 12,
    CapUnsupported = 13,
    CapBadOperation = 14,
    CapSeqError = 15,
    Denied = 16,
    FileExists = 17,
    FileNotFound = 18,
    NotEmpty = 19,
    PaperJam = 20,
    PaperDoubleFeed = 21,
    FileWriteError = 22,
    CheckDeviceOnline = 23,
}

impl ConditionCode {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0 => Self::Success,
            1 => Self::Bummer,
            2 => Self::LowMemory,
            3 => Self::NoDs,
            4 => Self::MaxConnections,
            5 => Self::OperationError,
            6 => Self::BadCap,
            9 => Self::BadProtocol,
            10 => Self::BadValue,
            11 => Self::SeqError,
            12 => Self::BadDest,
            13 => Self::CapUnsupported,
            14 => Self::CapBadOperation,
            15 => Self::CapSeqError,
            16 => Self::Denied,
            17 => Self::FileExists,
            18 => Self::FileNotFound,
            19 => Self::NotEmpty,
            20 => Self::PaperJam,
            21 => Self::PaperDoubleFeed,
            22 => Self::FileWriteError,
            23 => Self::CheckDeviceOnline,
            _ => Self::Bummer,
        }
    }
}

/// Top-level operation category of a triplet.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataGroup {
    Control = 0x0001,
    Image = 0x0002,
    Audio = 0x0004,
}

/// Flag set in an identity's supported groups marking a DSM-2 aware
/// application.
pub const DF_APP2: u32 = 0x2000_0000;
/// Flag reported by a DSM-2 manager.
pub const DF_DSM2: u32 = 0x1000_0000;
/// Flag reported by a DSM-2 aware source.
pub const DF_DS2: u32 = 0x4000_0000;

/// Data argument type: the structure a triplet acts upon.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dat {
    Null = 0x0000,
    Capability = 0x0001,
    Event = 0x0002,
    Identity = 0x0003,
    Parent = 0x0004,
    PendingXfers = 0x0005,
    SetupMemXfer = 0x0006,
    SetupFileXfer = 0x0007,
    Status = 0x0008,
    UserInterface = 0x0009,
    XferGroup = 0x000A,
    DeviceEvent = 0x000D,
    Callback = 0x0010,
    StatusUtf8 = 0x0011,
    Callback2 = 0x0012,
    ImageInfo = 0x0101,
    ImageLayout = 0x0102,
    ImageMemXfer = 0x0103,
    ImageNativeXfer = 0x0104,
    ImageFileXfer = 0x0105,
    IccProfile = 0x010D,
}

/// Message: the verb a triplet applies to its data argument type.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Msg {
    Null = 0x0000,
    Get = 0x0001,
    GetCurrent = 0x0002,
    GetDefault = 0x0003,
    GetFirst = 0x0004,
    GetNext = 0x0005,
    Set = 0x0006,
    Reset = 0x0007,
    QuerySupport = 0x0008,
    XferReady = 0x0101,
    CloseDsReq = 0x0102,
    CloseDsOk = 0x0103,
    DeviceEvent = 0x0104,
    OpenDsm = 0x0301,
    CloseDsm = 0x0302,
    OpenDs = 0x0401,
    CloseDs = 0x0402,
    UserSelect = 0x0403,
    DisableDs = 0x0501,
    EnableDs = 0x0502,
    EnableDsUiOnly = 0x0503,
    ProcessEvent = 0x0601,
    EndXfer = 0x0701,
    StopFeeder = 0x0702,
    RegisterCallback = 0x0902,
}

impl Msg {
    /// Maps a raw message id arriving through the callback boundary.
    /// Only the notification verbs a source may raise are recognized.
    pub fn from_notification(raw: u16) -> Option<Self> {
        match raw {
            0x0101 => Some(Self::XferReady),
            0x0102 => Some(Self::CloseDsReq),
            0x0103 => Some(Self::CloseDsOk),
            0x0104 => Some(Self::DeviceEvent),
            0x0000 => Some(Self::Null),
            _ => None,
        }
    }
}

/// Fixed 32-character string used inside identity records.
///
/// 34 bytes on the wire: 32 characters plus room for a terminating nul
/// pair, always nul-terminated.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TwStr32(pub [u8; 34]);

impl TwStr32 {
    pub fn new(s: &str) -> Self {
        let mut buf = [0u8; 34];
        for (dst, src) in buf.iter_mut().zip(s.bytes().take(32)) {
            *dst = src;
        }
        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(32);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl Default for TwStr32 {
    fn default() -> Self {
        Self([0u8; 34])
    }
}

impl PartialEq for TwStr32 {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for TwStr32 {}

impl fmt::Debug for TwStr32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for TwStr32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TwStr32 {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Fixed 255-character string used in file-transfer setup records.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TwStr255(pub [u8; 256]);

impl TwStr255 {
    pub fn new(s: &str) -> Self {
        let mut buf = [0u8; 256];
        for (dst, src) in buf.iter_mut().zip(s.bytes().take(255)) {
            *dst = src;
        }
        Self(buf)
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(255);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl Default for TwStr255 {
    fn default() -> Self {
        Self([0u8; 256])
    }
}

impl fmt::Debug for TwStr255 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// Version block inside an identity record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TwVersion {
    pub major_num: u16,
    pub minor_num: u16,
    pub language: u16,
    pub country: u16,
    pub info: TwStr32,
}

/// Structural identity of an application or a data source.
///
/// The numeric `id` is assigned by the manager when the identity is
/// opened; everything else is descriptive and compared structurally.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TwIdentity {
    pub id: u32,
    pub version: TwVersion,
    pub protocol_major: u16,
    pub protocol_minor: u16,
    pub supported_groups: u32,
    pub manufacturer: TwStr32,
    pub product_family: TwStr32,
    pub product_name: TwStr32,
}

impl TwIdentity {
    /// Structural key used by the session's source registry.
    pub fn source_key(&self) -> SourceKey {
        SourceKey {
            id: self.id,
            manufacturer: self.manufacturer.as_str().to_string(),
            product_family: self.product_family.as_str().to_string(),
            product_name: self.product_name.as_str().to_string(),
        }
    }
}

/// Registry key: manufacturer + product family + product name +
/// numeric id. The same key always resolves to the same handle
/// instance within one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub id: u32,
    pub manufacturer: String,
    pub product_family: String,
    pub product_name: String,
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.id, self.manufacturer, self.product_family, self.product_name
        )
    }
}

/// Status record returned by the manager's status query.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TwStatus {
    pub condition_code: u16,
    pub data: u16,
}

impl TwStatus {
    pub fn condition(&self) -> ConditionCode {
        ConditionCode::from_u16(self.condition_code)
    }
}

/// Payload for enabling and disabling a source's user interface.
///
/// `parent` is the caller-supplied window handle, passed through
/// opaquely as a pointer-sized integer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TwUserInterface {
    pub show_ui: u16,
    pub modal_ui: u16,
    pub parent: usize,
}

/// Pending-transfer bookkeeping exchanged during the transfer loop.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TwPendingXfers {
    pub count: u16,
    pub event_id: u32,
}

/// Memory descriptor returned by leaf GET operations such as the
/// ICC-profile query. The manager owns the referenced block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TwMemory {
    pub flags: u32,
    pub length: u32,
    pub mem: usize,
}

/// File-transfer setup payload.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TwSetupFileXfer {
    pub file_name: TwStr255,
    pub format: u16,
    pub vol_ref_num: i16,
}

impl Default for TwSetupFileXfer {
    fn default() -> Self {
        Self {
            file_name: TwStr255::default(),
            format: FileFormat::Bmp as u16,
            vol_ref_num: 0,
        }
    }
}

/// On-disk format requested for file transfers.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileFormat {
    Tiff = 0,
    Pict = 1,
    Bmp = 2,
    Xbm = 3,
    Jfif = 4,
    Fpx = 5,
    TiffMulti = 6,
    Png = 7,
    Spiff = 8,
    Exif = 9,
    Pdf = 10,
}

/// How a source should be enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceEnableMode {
    /// Acquire without showing the source's own user interface.
    NoUi,
    /// Show the source's user interface.
    ShowUi,
    /// Show the interface for settings only; no acquisition.
    ShowUiOnly,
}

/// Opaque parent-window handle passed through to manager and source
/// open/enable calls. Zero means "no window".
pub type WindowHandle = usize;

/// Application identity configuration for a session.
///
/// Built once, validated when the session is constructed, and turned
/// into the application's identity record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub product_name: String,
    pub manufacturer: String,
    pub product_family: String,
    pub version_major: u16,
    pub version_minor: u16,
    pub version_info: String,
    pub language: u16,
    pub country: u16,
    pub data_groups: u32,
}

impl SessionConfig {
    pub fn new(product_name: impl Into<String>, manufacturer: impl Into<String>) -> Self {
        Self {
            product_name: product_name.into(),
            manufacturer: manufacturer.into(),
            product_family: String::new(),
            version_major: 1,
            version_minor: 0,
            version_info: String::new(),
            language: 13,  // english (US)
            country: 840,  // USA
            data_groups: DataGroup::Control as u32 | DataGroup::Image as u32,
        }
    }

    pub fn with_product_family(mut self, family: impl Into<String>) -> Self {
        self.product_family = family.into();
        self
    }

    pub fn with_version(mut self, major: u16, minor: u16, info: impl Into<String>) -> Self {
        self.version_major = major;
        self.version_minor = minor;
        self.version_info = info.into();
        self
    }

    pub fn with_data_groups(mut self, groups: u32) -> Self {
        self.data_groups = groups;
        self
    }

    /// Builds the application identity record sent to the manager.
    pub fn to_identity(&self) -> TwIdentity {
        TwIdentity {
            id: 0,
            version: TwVersion {
                major_num: self.version_major,
                minor_num: self.version_minor,
                language: self.language,
                country: self.country,
                info: TwStr32::new(&self.version_info),
            },
            protocol_major: 2,
            protocol_minor: 4,
            supported_groups: self.data_groups | DF_APP2,
            manufacturer: TwStr32::new(&self.manufacturer),
            product_family: TwStr32::new(&self.product_family),
            product_name: TwStr32::new(&self.product_name),
        }
    }
}
