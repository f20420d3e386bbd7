use std::{fmt, io};

#[derive(Clone, Copy, Debug)]
pub enum ErrorCode {
    NoTarget = 1,
    NoExecutionScope = 2,
    NoFrame = 3,
    AllocationFailed = 4,
    DeallocationFailed = 5,
    ReadFailed = 6,
    WriteFailed = 7,
    SizeMismatch = 8,
    DoubleAllocation = 9,
    BadAddressForm = 10,
    NotMaterialized = 11,
    NotDematerialized = 12,
    AlreadyMaterialized = 13,
    Invalidated = 14,
    WrongEntry = 15,
    NoAddress = 16,
    Internal = 17,
}

#[derive(Debug)]
pub enum ErrorEnum {
    IO(io::Error),
    Code(ErrorCode),
}

#[derive(Clone)]
pub struct Error {
    pub error: ErrorEnum,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: ErrorCode, message: String) -> Error {
        Error {error: ErrorEnum::Code(code), message}
    }

    pub fn is_no_target(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::NoTarget) => true, _ => false, } }
    pub fn is_no_execution_scope(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::NoExecutionScope) => true, _ => false, } }
    pub fn is_no_frame(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::NoFrame) => true, _ => false, } }
    pub fn is_allocation_failed(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::AllocationFailed) => true, _ => false, } }
    pub fn is_deallocation_failed(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::DeallocationFailed) => true, _ => false, } }
    pub fn is_read_failed(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::ReadFailed) => true, _ => false, } }
    pub fn is_size_mismatch(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::SizeMismatch) => true, _ => false, } }
    pub fn is_double_allocation(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::DoubleAllocation) => true, _ => false, } }
    pub fn is_bad_address_form(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::BadAddressForm) => true, _ => false, } }
    pub fn is_not_materialized(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::NotMaterialized) => true, _ => false, } }
    pub fn is_not_dematerialized(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::NotDematerialized) => true, _ => false, } }
    pub fn is_already_materialized(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::AlreadyMaterialized) => true, _ => false, } }
    pub fn is_invalidated(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::Invalidated) => true, _ => false, } }
    pub fn is_wrong_entry(&self) -> bool { match self.error { ErrorEnum::Code(ErrorCode::WrongEntry) => true, _ => false, } }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error {error: ErrorEnum::IO(error), message: String::new()}
    }
}

// For printing to log.
impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(code) => write!(f, "{}: {}", code as i64, self.message),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

// For showing to the user.
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error {
            &ErrorEnum::Code(_) => write!(f, "{}", self.message),
            ErrorEnum::IO(error) if self.message.is_empty() => write!(f, "{}", error),
            ErrorEnum::IO(error) => write!(f, "{}: {}", self.message, error),
        }
    }
}

impl Clone for ErrorEnum {
    fn clone(&self) -> Self {
        match self {
            Self::Code(c) => Self::Code(c.clone()),
            Self::IO(e) => Self::IO(match e.raw_os_error() {
                Some(os) => io::Error::from_raw_os_error(os),
                None => e.kind().into(),
            }),
        }
    }
}

#[macro_export]
macro_rules! error {
    ($code:ident, $($arg:tt)*) => (
        Error {error: ErrorEnum::Code(ErrorCode::$code), message: format!($($arg)*)}
    );
}

#[macro_export]
macro_rules! err {
    ($code:ident, $($arg:tt)*) => (
        Err(error!($code, $($arg)*))
    );
}
