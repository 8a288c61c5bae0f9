//! `${VAR}` expansion for server launch parameters.

use std::path::PathBuf;

use crate::schema::ToolhostConfig;

/// Expand `${VAR}` placeholders in every server's command, args, env values
/// and working directory, using the process environment.
pub fn expand_server_env(config: &mut ToolhostConfig) {
    expand_server_env_with(config, |name| std::env::var(name).ok());
}

fn expand_server_env_with(config: &mut ToolhostConfig, lookup: impl Fn(&str) -> Option<String>) {
    for server in &mut config.servers {
        server.command = substitute_with(&server.command, &lookup);
        for arg in &mut server.args {
            *arg = substitute_with(arg, &lookup);
        }
        for value in server.env.values_mut() {
            *value = substitute_with(value, &lookup);
        }
        if let Some(dir) = server.working_dir.as_mut()
            && let Some(raw) = dir.to_str()
        {
            *dir = PathBuf::from(substitute_with(raw, &lookup));
        }
    }
}

/// Unresolvable variables and unterminated placeholders are left as written.
fn substitute_with(input: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    },
                }
                rest = &after[end + 1..];
            },
            _ => {
                out.push_str("${");
                rest = after;
            },
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::ServerDescriptor;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "TOOLHOST_ROOT" => Some("/srv/tools".to_string()),
            "TOKEN" => Some("s3cret".to_string()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_known_var() {
        assert_eq!(
            substitute_with("root=${TOOLHOST_ROOT}/bin", &lookup),
            "root=/srv/tools/bin"
        );
    }

    #[test]
    fn leaves_unknown_and_malformed_placeholders() {
        assert_eq!(substitute_with("${NOPE_XYZ}", &lookup), "${NOPE_XYZ}");
        assert_eq!(substitute_with("a ${unterminated", &lookup), "a ${unterminated");
        assert_eq!(substitute_with("${}", &lookup), "${}");
    }

    #[test]
    fn expands_descriptor_fields() {
        let mut server = ServerDescriptor::new("fs", "${TOOLHOST_ROOT}/fs-server")
            .with_args(["--token", "${TOKEN}"]);
        server.env.insert("API".into(), "${TOKEN}".into());
        server.working_dir = Some(PathBuf::from("${TOOLHOST_ROOT}/work"));
        let mut config = ToolhostConfig {
            servers: vec![server],
            ..ToolhostConfig::default()
        };

        expand_server_env_with(&mut config, lookup);

        let server = &config.servers[0];
        assert_eq!(server.command, "/srv/tools/fs-server");
        assert_eq!(server.args, vec!["--token", "s3cret"]);
        assert_eq!(server.env["API"], "s3cret");
        assert_eq!(server.working_dir, Some(PathBuf::from("/srv/tools/work")));
    }
}
