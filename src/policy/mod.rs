// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Policy synthesis: the SGT×SGT matrix, SGACL generation, enforcement
//! impact analysis, and the deployment package.

/// Deployment package assembly.
pub mod exporter;
/// Enforcement impact analysis.
pub mod impact;
/// SGT×SGT traffic matrix.
pub mod matrix;
/// SGACL rule generation.
pub mod sgacl;
