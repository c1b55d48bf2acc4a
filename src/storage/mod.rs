// Copyright 2025 coScene
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

// Record store module
//
// Provides a trait-based abstraction over durable record storage so the
// gateway and query engine work against either the on-disk append log or
// a volatile in-memory store.

pub mod backend;
pub mod codec;
pub mod factory;
pub mod log;
pub mod memory;

pub use backend::{RecordStore, Recovery};
pub use codec::{CompressionLevel, CompressionType, PayloadCodec};
pub use factory::BackendFactory;
pub use log::LogBackend;
pub use memory::MemoryBackend;
