//! Out-of-process guests written in `sh`.
//!
//! The scripts speak the line protocol with nothing more than `read`, `case`
//! and `sed`, which keeps process-backend tests free of build steps.

use std::collections::BTreeMap;

/// Interpreter table mapping `.sh` entry points to `/bin/sh`.
#[must_use]
pub fn sh_interpreters() -> BTreeMap<String, String> {
    BTreeMap::from([("sh".to_string(), "/bin/sh".to_string())])
}

/// Canned script guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptGuest {
    /// Answer every invocation with `{"pid": <pid>}`.
    Echo,
    /// Answer every invocation with an error outcome.
    Fail,
    /// Exit with status 3 on the first invocation.
    CrashOnInvoke,
    /// Sleep this many seconds before answering each invocation.
    Slow(u32),
    /// Never announce readiness.
    Silent,
}

impl ScriptGuest {
    /// Script source.
    #[must_use]
    pub fn source(self) -> String {
        let on_invoke = match self {
            Self::Echo => OK_REPLY.to_string(),
            Self::Fail => ERROR_REPLY.to_string(),
            Self::CrashOnInvoke => "      exit 3".to_string(),
            Self::Slow(secs) => format!("      sleep {secs}\n{OK_REPLY}"),
            Self::Silent => {
                return "#!/bin/sh\nwhile IFS= read -r line; do :; done\n".to_string();
            },
        };
        format!(
            r#"#!/bin/sh
echo '{{"type":"ready","protocol":1}}'
while IFS= read -r line; do
  case "$line" in
    *'"type":"invoke"'*)
      id=$(printf '%s' "$line" | sed -n 's/.*"call_id":\([0-9]*\).*/\1/p')
{on_invoke}
      ;;
    *'"type":"shutdown"'*)
      exit 0
      ;;
  esac
done
"#
        )
    }
}

const OK_REPLY: &str = r#"      printf '{"type":"result","call_id":%s,"outcome":{"status":"ok","value":{"pid":%s}}}\n' "$id" "$$""#;

const ERROR_REPLY: &str = r#"      printf '{"type":"result","call_id":%s,"outcome":{"status":"error","message":"scripted failure"}}\n' "$id""#;
