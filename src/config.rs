// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Toggles threaded through the walker (`walk`) and rule application
/// (`rules`). Mirrors the CLI surface one-to-one.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Keep the (rare) 3.9 shape in which a line-number entry attaches
    /// to an `EXTENDED_ARG` prefix rather than the instruction that
    /// follows it, instead of re-anchoring it to the following
    /// instruction.
    pub preserve_lineno_after_extarg: bool,
    /// Disable the finally-synthesis rule (rule 4 of the rewrite set).
    pub no_begin_finally: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            preserve_lineno_after_extarg: false,
            no_begin_finally: false,
        }
    }
}
