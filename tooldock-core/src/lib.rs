// Copyright 2025 Tooldock (https://github.com/tooldock)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Shared declarative types for tooldock.
//!
//! This crate holds everything a tool author's manifest describes and the
//! wire envelope every child call returns. It performs no I/O beyond
//! reading a manifest file from a tool directory.

pub mod envelope;
pub mod manifest;

pub use envelope::{CallEnvelope, CallError};
pub use manifest::{
    Health, Manifest, ManifestError, Method, Mode, Resources, Rpc, Runtime, Schema, Transport,
    FILE_TYPE, MANIFEST_FILENAME,
};
