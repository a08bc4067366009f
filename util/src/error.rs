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
pub enum UtilError {
    #[error("Io")]
    Io {
        #[from]
        source: std::io::Error,
    },
    // loop_context submodule errors
    #[error("Found bad syscall, error is {0} .")]
    BadSyscall(std::io::Error),
    #[error("Failed to execute epoll_wait syscall: {0} .")]
    EpollWait(std::io::Error),
    #[error("The fd {0} is not registered in epoll.")]
    NoRegisterFd(i32),
    #[error("Notifier Operation non allowed.")]
    BadNotifierOperation,
    // unix submodule errors
    #[error("Failed to read /proc/{0}/stat")]
    ReadProcStat(i32),
    #[error("Malformed /proc/{0}/stat")]
    ParseProcStat(i32),
}
