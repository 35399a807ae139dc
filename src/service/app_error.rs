// Copyright 2025 the Muster authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bind error: {0}")]
    Bind(String),

    #[error("accept error: {0}")]
    Accept(String),

    #[error("connect error: {0}")]
    Connect(String),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    /// marker error used by the incremental frame parser
    #[error("incomplete frame")]
    Incomplete,
}
