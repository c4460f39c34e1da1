// Copyright 2026 the Dispatch VM Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Conformance tests for `dispatch_vm` live under `tests/`.
