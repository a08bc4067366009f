// Copyright (c) 2025 Huawei Technologies Co.,Ltd. All rights reserved.
//
// ozoned is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use thiserror::Error;

/// User-visible error kinds. Every operation either succeeds or fails
/// with exactly one of these; kernel errors come through as `Unknown`
/// with the errno and operation site preserved in the message.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Invalid property: {0}")]
    InvalidProperty(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Not supported: {0}")]
    NotSupported(String),
    #[error("Permission error: {0}")]
    Permission(String),
    #[error("Resource not available: {0}")]
    ResourceNotAvailable(String),
    #[error("Container already exists: {0}")]
    ContainerAlreadyExists(String),
    #[error("Container does not exist: {0}")]
    ContainerDoesNotExist(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Unknown(_) => "Unknown",
            Error::InvalidValue(_) => "InvalidValue",
            Error::InvalidProperty(_) => "InvalidProperty",
            Error::InvalidData(_) => "InvalidData",
            Error::InvalidState(_) => "InvalidState",
            Error::NotSupported(_) => "NotSupported",
            Error::Permission(_) => "Permission",
            Error::ResourceNotAvailable(_) => "ResourceNotAvailable",
            Error::ContainerAlreadyExists(_) => "ContainerAlreadyExists",
            Error::ContainerDoesNotExist(_) => "ContainerDoesNotExist",
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        match errno_of(&e) {
            Some(errno) => Error::Unknown(format!("{:#} (errno {})", e, errno)),
            None => Error::Unknown(format!("{:#}", e)),
        }
    }
}

/// Dig the errno out of an anyhow chain, if an io error caused it.
pub fn errno_of(e: &anyhow::Error) -> Option<i32> {
    for cause in e.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if let Some(errno) = io.raw_os_error() {
                return Some(errno);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_errno_survives_context_chain() {
        let io = std::io::Error::from_raw_os_error(libc::EBUSY);
        let err = anyhow::Error::from(io).context("Failed to write memory.limit_in_bytes");
        assert_eq!(errno_of(&err), Some(libc::EBUSY));

        let err: Error = err.into();
        assert_eq!(err.kind_name(), "Unknown");
        assert!(err.to_string().contains("errno 16"));
    }

    #[test]
    fn test_plain_error_has_no_errno() {
        let err = anyhow::anyhow!("no io under this");
        assert_eq!(errno_of(&err), None);
    }
}
