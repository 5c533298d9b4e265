// src/target/command.rs

//! Shell command rendering.
//!
//! A [`RemoteCommand`] is the user's command plus the [`CommandContext`] it
//! runs in. `render` produces the single shell line handed to `sh -c` (local)
//! or to `ssh` (remote):
//!
//! ```text
//! cd /srv/app && export RAILS_ENV=production && (source venv && ./migrate)
//! ```
//!
//! Directories and env values are shell-quoted. A leading `~/` is kept
//! outside the quotes so it still expands to the target user's home.

use std::borrow::Cow;
use std::collections::BTreeMap;

/// Working directory, environment and prefixes shared by the commands of
/// one action. Cheap to clone; `with_*` return a modified copy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandContext {
    cwd: Vec<String>,
    env: Vec<(String, String)>,
    prefixes: Vec<String>,
    term: Option<String>,
}

impl CommandContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `path`. Relative paths nest inside the current directory.
    pub fn with_cwd(&self, path: impl Into<String>) -> Self {
        let path = path.into();
        let mut next = self.clone();
        if path.starts_with('/') || path.starts_with('~') {
            next.cwd.clear();
        }
        next.cwd.push(path);
        next
    }

    pub fn with_env(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let mut next = self.clone();
        next.env.retain(|(k, _)| *k != key);
        next.env.push((key, value.into()));
        next
    }

    pub fn with_envs(&self, vars: &BTreeMap<String, String>) -> Self {
        vars.iter()
            .fold(self.clone(), |ctx, (k, v)| ctx.with_env(k.clone(), v.clone()))
    }

    /// Run every command after `prefix` (e.g. `source venv/bin/activate`).
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.prefixes.push(prefix.into());
        next
    }

    pub fn with_term(&self, term: Option<String>) -> Self {
        let mut next = self.clone();
        next.term = term;
        next
    }

    /// Current working directory, if any was entered.
    pub fn cwd(&self) -> Option<String> {
        if self.cwd.is_empty() {
            return None;
        }
        let mut out = String::new();
        for part in &self.cwd {
            if !out.is_empty() && !out.ends_with('/') {
                out.push('/');
            }
            out.push_str(part);
        }
        Some(out)
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub command: String,
    pub context: CommandContext,
    /// Run through `sudo`. With `user`, as that user.
    pub sudo: Option<SudoMode>,
    sandboxed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SudoMode {
    Root,
    User(String),
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            context: CommandContext::default(),
            sudo: None,
            sandboxed: false,
        }
    }

    pub fn with_context(mut self, context: CommandContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_sudo(mut self, sudo: Option<SudoMode>) -> Self {
        self.sudo = sudo;
        self
    }

    /// Same command, but only syntax-checked (`bash -n`) and echoed.
    pub fn sandboxed(&self) -> Self {
        let mut next = self.clone();
        next.sandboxed = true;
        next
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    /// The full shell line to execute on the target.
    pub fn render(&self) -> String {
        let mut inner = self.context.prefixes.clone();
        inner.push(self.command.clone());
        let mut body = inner.join(" && ");

        if self.sandboxed {
            let q = quote(&body);
            body = format!("bash -n -c {q}; echo {q}");
        }

        body = match &self.sudo {
            None => body,
            Some(SudoMode::Root) => format!("sudo bash -c {}", quote(&body)),
            Some(SudoMode::User(user)) => {
                format!("sudo su {} -c {}", quote(user), quote(&body))
            }
        };

        let mut parts = Vec::new();
        for dir in &self.context.cwd {
            let dir = quote_path(dir);
            if self.sandboxed {
                // The directory may only be created by an earlier, skipped step.
                parts.push(format!("if [ -d {dir} ]; then cd {dir}; fi"));
            } else {
                parts.push(format!("cd {dir}"));
            }
        }
        if let Some(term) = &self.context.term {
            parts.push(format!("export TERM={}", quote(term)));
        }
        for (key, value) in &self.context.env {
            parts.push(format!("export {key}={}", quote(value)));
        }

        if parts.is_empty() {
            return body;
        }
        parts.push(format!("({body})"));
        parts.join(" && ")
    }
}

/// Single-quote `s` for a POSIX shell.
pub fn quote(s: &str) -> String {
    let cleaned: Cow<'_, str> = if s.contains('\0') {
        Cow::Owned(s.replace('\0', ""))
    } else {
        Cow::Borrowed(s)
    };
    shlex::try_quote(&cleaned)
        .map(Cow::into_owned)
        .unwrap_or_default()
}

/// Like [`quote`], but `~` and a leading `~/` stay expandable.
fn quote_path(path: &str) -> String {
    if path == "~" {
        return path.to_string();
    }
    match path.strip_prefix("~/") {
        Some("") => "~/".to_string(),
        Some(rest) => format!("~/{}", quote(rest)),
        None => quote(path),
    }
}

/// Replace `{0}`, `{1}`, ... with positional arguments and `{name}` with
/// keyword arguments, each shell-quoted. Unknown placeholders stay as-is.
pub fn render_template(
    template: &str,
    positional: &[String],
    keyword: &BTreeMap<String, String>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let key = &after[..end];
        let value = match key.parse::<usize>() {
            Ok(i) => positional.get(i),
            Err(_) => keyword.get(key),
        };
        match value {
            Some(v) => out.push_str(&quote(v)),
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_command_is_untouched() {
        assert_eq!(RemoteCommand::new("uptime").render(), "uptime");
    }

    #[test]
    fn context_prefixes_compose_in_order() {
        let ctx = CommandContext::new()
            .with_cwd("/srv")
            .with_cwd("app")
            .with_env("MODE", "prod")
            .with_prefix("source venv/bin/activate");
        let cmd = RemoteCommand::new("./migrate").with_context(ctx.clone());

        assert_eq!(ctx.cwd().as_deref(), Some("/srv/app"));
        assert_eq!(
            cmd.render(),
            "cd /srv && cd app && export MODE=prod && (source venv/bin/activate && ./migrate)"
        );
    }

    #[test]
    fn absolute_cwd_replaces_previous() {
        let ctx = CommandContext::new().with_cwd("/a").with_cwd("/b");
        assert_eq!(ctx.cwd().as_deref(), Some("/b"));
    }

    #[test]
    fn sandbox_only_checks_syntax() {
        let ctx = CommandContext::new().with_cwd("/srv");
        let cmd = RemoteCommand::new("rm -rf build").with_context(ctx).sandboxed();
        assert_eq!(
            cmd.render(),
            "if [ -d /srv ]; then cd /srv; fi && (bash -n -c 'rm -rf build'; echo 'rm -rf build')"
        );
    }

    #[test]
    fn sudo_as_user_quotes_body() {
        let cmd = RemoteCommand::new("echo $HOME")
            .with_sudo(Some(SudoMode::User("postgres".into())));
        assert_eq!(cmd.render(), "sudo su postgres -c 'echo $HOME'");
    }

    #[test]
    fn env_values_and_directories_are_quoted() {
        let ctx = CommandContext::new()
            .with_cwd("/srv/my app")
            .with_env("MODE", "production mode");
        let cmd = RemoteCommand::new("./run").with_context(ctx);
        assert_eq!(
            cmd.render(),
            "cd '/srv/my app' && export MODE='production mode' && (./run)"
        );
    }

    #[test]
    fn home_relative_directory_keeps_the_tilde() {
        let ctx = CommandContext::new().with_cwd("~/releases/v 2");
        let cmd = RemoteCommand::new("ls").with_context(ctx);
        assert_eq!(cmd.render(), "cd ~/'releases/v 2' && (ls)");

        let home = RemoteCommand::new("ls").with_context(CommandContext::new().with_cwd("~"));
        assert_eq!(home.render(), "cd ~ && (ls)");
    }

    #[test]
    fn env_metacharacters_are_not_evaluated() {
        let ctx = CommandContext::new().with_env("TOKEN", "a;b $HOME `id`");
        let rendered = RemoteCommand::new("true").with_context(ctx).render();
        let words = shlex::split(rendered.split(" && ").next().unwrap()).unwrap();
        assert_eq!(words, vec!["export", "TOKEN=a;b $HOME `id`"]);
    }

    #[test]
    fn template_placeholders_are_quoted() {
        let mut kw = BTreeMap::new();
        kw.insert("branch".to_string(), "feature x".to_string());
        let out = render_template(
            "deploy {0} --branch {branch} {missing}",
            &["v1.2".to_string()],
            &kw,
        );
        assert_eq!(out, "deploy v1.2 --branch 'feature x' {missing}");
    }
}
