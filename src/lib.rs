//! A pure Rust media pipeline runtime in the OpenMAX IL style, suitable
//! for building graph-based music players.
//!
//! The crate is layered the way the pipeline is:
//!
//! - [`il`]: the component layer: buffer headers, ports, the
//!   per-component kernel and processor servant, and the component shell.
//! - [`graph`]: the graph layer: probing, tunnel wiring, and the FSM that
//!   drives a pipeline through load, configure, execute, reconfigure,
//!   skip, pause and stop.
//! - [`components`]: the in-tree file source, WAV decoder, and writer
//!   sink.
//! - [`manager`]: cross-graph policy: the playlist, graph selection, and
//!   the state surface control frontends observe.

#![warn(
    anonymous_parameters,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    single_use_lifetimes,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_extern_crates,
    unused_qualifications,
    variant_size_differences
)]

use std::path::PathBuf;

pub mod components;
pub mod graph;
pub mod il;
pub mod manager;

#[cfg(test)]
pub(crate) mod testutil;

/// Attempts to determine the configuration file path from the runtime
/// environment, checking the following locations in order:
///   - $ADAGIO_CONFIG
///   - $XDG_CONFIG_HOME/adagio/adagio.conf
///   - $HOME/.config/adagio/adagio.conf
///
/// Returns None if no file exists at any of them.
pub fn config_path_from_env() -> Option<PathBuf> {
    let mut paths = std::env::var("ADAGIO_CONFIG")
        .ok()
        .map(PathBuf::from)
        .into_iter()
        .chain(
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(|s| PathBuf::from(s).join("adagio/adagio.conf")),
        )
        .chain(
            std::env::var("HOME")
                .ok()
                .map(|s| PathBuf::from(s).join(".config/adagio/adagio.conf")),
        );

    paths.find(|path| path.exists())
}
