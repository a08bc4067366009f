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

#[derive(Error, Debug)]
pub enum CgroupError {
    #[error("Io")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("No mounted hierarchy found for subsystem {0}")]
    NoHierarchy(&'static str),
    #[error("Failed to write {0} to {1}")]
    WriteKnob(String, String),
    #[error("Failed to read {0}")]
    ReadKnob(String),
    #[error("Kernel does not support knob {0}")]
    NoKnob(String),
    #[error("Freezer did not settle in state {0}")]
    FreezerStuck(&'static str),
}
