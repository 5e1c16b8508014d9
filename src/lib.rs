/*
 * swiftfetch - High-throughput multi-protocol transfer engine.
 * Copyright (C) 2025  swiftfetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! High-throughput multi-protocol transfer engine.
//!
//! swiftfetch retrieves remote resources over HTTP/1.1, HTTP/2, FTP, and
//! SFTP/SCP with adaptive parallel range requests, incremental integrity
//! verification, and crash-safe resume.

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod protocols;
pub mod tls;

pub use config::Config;
pub use engine::{FetchController, FetchFailure, FetchOutcome, FetchReport, FetchRequest};
pub use error::{ErrorKind, FetchError};
pub use events::{EventSink, NullSink};
