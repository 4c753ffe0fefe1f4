//! Structured remote commands
//!
//! Commands are built from a program and discrete arguments and only turned
//! into a shell line at the last moment, with every argument quoted. Secret
//! arguments never show up in `Display` or `Debug` output.

use std::fmt;

#[derive(Clone)]
enum Arg {
    Plain(String),
    Secret(String),
}

impl Arg {
    fn value(&self) -> &str {
        match self {
            Arg::Plain(v) | Arg::Secret(v) => v,
        }
    }
}

/// A program plus arguments to run on a remote host
#[derive(Clone)]
pub struct RemoteCommand {
    program: String,
    args: Vec<Arg>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Build from a configured binary such as `docker` or `sudo docker`
    pub fn from_binary(binary: &str) -> Self {
        let mut words = binary.split_whitespace();
        let program = words.next().unwrap_or("docker");
        let mut command = Self::new(program);
        for word in words {
            command = command.arg(word);
        }
        command
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(Arg::Plain(value.into()));
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args
            .extend(values.into_iter().map(|v| Arg::Plain(v.into())));
        self
    }

    /// Argument that carries a credential
    pub fn secret_arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(Arg::Secret(value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// The quoted command line sent to the remote shell
    pub fn render(&self) -> String {
        let mut line = shell_quote(&self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_quote(arg.value()));
        }
        line
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_quote(&self.program))?;
        for arg in &self.args {
            match arg {
                Arg::Plain(v) => write!(f, " {}", shell_quote(v))?,
                Arg::Secret(_) => f.write_str(" ***")?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteCommand({self})")
    }
}

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_./:=@%+,-".contains(c)
}

/// Quote one word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty() && word.chars().all(is_safe) {
        return word.to_string();
    }
    let mut quoted = String::with_capacity(word.len() + 2);
    quoted.push('\'');
    for c in word.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}
