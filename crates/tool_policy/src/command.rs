//! Shell command shape analysis for checkpoint planning.
//!
//! This is a best-effort reading of a POSIX-ish command line: quotes, escapes,
//! separators and redirections are understood; expansions are not evaluated.
//! Anything the analysis cannot pin down to concrete paths is reported as
//! unresolved so callers can fall back to a wider snapshot.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    /// Output redirection; the next word is the file written.
    WriteRedirect,
    /// Input redirection or heredoc; the next word is not a command argument.
    ReadRedirect,
    Separator,
}

/// Mutation facts extracted from a command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandShape {
    pub mutating: bool,
    /// At least one mutation target could not be named (globs, variables,
    /// subcommands with implicit targets such as `git checkout`).
    pub unresolved: bool,
    /// Raw path words as written in the command.
    pub targets: Vec<String>,
    /// `cp`/`mv` invocations as `(sources, destination)` so directory
    /// destinations can be expanded by the caller.
    pub copies: Vec<(Vec<String>, String)>,
}

impl CommandShape {
    fn merge(&mut self, other: CommandShape) {
        self.mutating |= other.mutating;
        self.unresolved |= other.unresolved;
        self.targets.extend(other.targets);
        self.copies.extend(other.copies);
    }

    fn add_target(&mut self, word: &str) {
        if is_dynamic_word(word) {
            self.unresolved = true;
        } else {
            self.targets.push(word.to_string());
        }
    }
}

const WRAPPERS: &[&str] = &["sudo", "nohup", "time", "command", "env", "exec", "nice"];
const SHELLS: &[&str] = &["sh", "bash", "zsh", "dash"];
const GIT_MUTATING: &[&str] = &[
    "checkout",
    "reset",
    "clean",
    "apply",
    "stash",
    "rebase",
    "merge",
    "restore",
    "switch",
    "pull",
    "am",
    "cherry-pick",
    "revert",
    "rm",
    "mv",
];

/// Analyzes `command` and reports whether and where it may write.
#[must_use]
pub fn analyze(command: &str) -> CommandShape {
    analyze_depth(command, 0)
}

fn analyze_depth(command: &str, depth: usize) -> CommandShape {
    let mut shape = CommandShape::default();
    let tokens = tokenize(command);

    for segment in tokens.split(|token| *token == Token::Separator) {
        let mut words = Vec::new();
        let mut iter = segment.iter();
        while let Some(token) = iter.next() {
            match token {
                Token::Word(word) => words.push(word.as_str()),
                Token::WriteRedirect => match iter.next() {
                    Some(Token::Word(target)) if !is_device_sink(target) => {
                        shape.mutating = true;
                        shape.add_target(target);
                    }
                    _ => {}
                },
                Token::ReadRedirect => {
                    iter.next();
                }
                Token::Separator => {}
            }
        }
        shape.merge(analyze_simple(&words, depth));
    }

    shape
}

fn analyze_simple(words: &[&str], depth: usize) -> CommandShape {
    let mut shape = CommandShape::default();
    let words = strip_prefixes(words);
    let Some((program, args)) = words.split_first() else {
        return shape;
    };
    let program = program.rsplit('/').next().unwrap_or(program);
    let positional = positional_args(args);

    match program {
        "rm" | "rmdir" | "touch" | "mkdir" | "tee" | "ln" | "unlink" | "shred" => {
            shape.mutating = true;
            for word in positional {
                shape.add_target(word);
            }
        }
        "truncate" => {
            shape.mutating = true;
            let mut skip_next = false;
            for word in args {
                if skip_next {
                    skip_next = false;
                    continue;
                }
                if matches!(*word, "-s" | "--size" | "-r" | "--reference") {
                    skip_next = true;
                } else if !word.starts_with('-') {
                    shape.add_target(word);
                }
            }
        }
        "cp" | "mv" | "install" => {
            shape.mutating = true;
            for word in &positional {
                shape.add_target(word);
            }
            if let Some((destination, sources)) = positional.split_last() {
                if !sources.is_empty() && !is_dynamic_word(destination) {
                    shape.copies.push((
                        sources.iter().map(|word| (*word).to_string()).collect(),
                        (*destination).to_string(),
                    ));
                }
            }
        }
        "chmod" | "chown" | "chgrp" => {
            shape.mutating = true;
            for word in positional.iter().skip(1) {
                shape.add_target(word);
            }
        }
        "sed" => {
            let in_place = args
                .iter()
                .any(|word| word.starts_with("-i") || word.starts_with("--in-place"));
            if in_place {
                shape.mutating = true;
                let mut files = Vec::new();
                let mut has_script_flag = false;
                let mut skip_next = false;
                for word in args {
                    if skip_next {
                        skip_next = false;
                    } else if matches!(*word, "-e" | "-f" | "--expression" | "--file") {
                        has_script_flag = true;
                        skip_next = true;
                    } else if !word.starts_with('-') {
                        files.push(*word);
                    }
                }
                let skip = usize::from(!has_script_flag);
                for word in files.iter().skip(skip) {
                    shape.add_target(word);
                }
            }
        }
        "patch" => {
            shape.mutating = true;
            shape.unresolved = true;
        }
        "git" => {
            if positional
                .first()
                .is_some_and(|subcommand| GIT_MUTATING.contains(subcommand))
            {
                shape.mutating = true;
                shape.unresolved = true;
            }
        }
        "find" => {
            let deletes = args.iter().any(|word| *word == "-delete");
            let executes = args.windows(2).any(|pair| {
                matches!(pair[0], "-exec" | "-execdir" | "-ok") && is_mutating_program(pair[1])
            });
            if deletes || executes {
                shape.mutating = true;
                shape.unresolved = true;
            }
        }
        "xargs" => {
            if positional
                .first()
                .is_some_and(|program| is_mutating_program(program))
            {
                shape.mutating = true;
                shape.unresolved = true;
            }
        }
        shell if SHELLS.contains(&shell) && depth < 2 => {
            if let Some(index) = args.iter().position(|word| *word == "-c" || *word == "-lc") {
                if let Some(script) = args.get(index + 1) {
                    shape.merge(analyze_depth(script, depth + 1));
                }
            }
        }
        _ => {}
    }

    shape
}

fn is_mutating_program(word: &str) -> bool {
    let program = word.rsplit('/').next().unwrap_or(word);
    matches!(
        program,
        "rm" | "rmdir"
            | "mv"
            | "cp"
            | "touch"
            | "mkdir"
            | "tee"
            | "truncate"
            | "chmod"
            | "chown"
            | "ln"
            | "sed"
            | "shred"
            | "unlink"
    )
}

/// Drops leading environment assignments and wrapper commands such as `sudo`.
fn strip_prefixes<'a>(mut words: &'a [&'a str]) -> &'a [&'a str] {
    loop {
        let Some((first, rest)) = words.split_first() else {
            return words;
        };
        let is_assignment = first.contains('=')
            && first
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if is_assignment {
            words = rest;
        } else if WRAPPERS.contains(first) {
            let flags = rest.iter().take_while(|word| word.starts_with('-')).count();
            words = &rest[flags..];
        } else {
            return words;
        }
    }
}

/// Non-flag arguments; everything after `--` counts as positional.
fn positional_args<'a>(args: &[&'a str]) -> Vec<&'a str> {
    let mut positional = Vec::new();
    let mut flags_done = false;
    for word in args {
        if !flags_done && *word == "--" {
            flags_done = true;
        } else if flags_done || !word.starts_with('-') || *word == "-" {
            positional.push(*word);
        }
    }
    positional
}

fn is_dynamic_word(word: &str) -> bool {
    word.contains(['*', '?', '[', '$', '`']) || word.starts_with('~')
}

fn is_device_sink(word: &str) -> bool {
    matches!(word, "/dev/null" | "/dev/stdout" | "/dev/stderr" | "/dev/tty")
}

fn tokenize(command: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = command.chars().peekable();

    fn flush(tokens: &mut Vec<Token>, word: &mut String, in_word: &mut bool) {
        if *in_word {
            tokens.push(Token::Word(std::mem::take(word)));
            *in_word = false;
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for next in chars.by_ref() {
                    if next == '\'' {
                        break;
                    }
                    word.push(next);
                }
            }
            '"' => {
                in_word = true;
                while let Some(next) = chars.next() {
                    match next {
                        '"' => break,
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                word.push(escaped);
                            }
                        }
                        other => word.push(other),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(escaped) = chars.next() {
                    word.push(escaped);
                }
            }
            '>' => {
                // `2>` and similar: the digits name a descriptor, not a word.
                if in_word && word.chars().all(|ch| ch.is_ascii_digit()) {
                    word.clear();
                    in_word = false;
                }
                flush(&mut tokens, &mut word, &mut in_word);
                if chars.peek() == Some(&'>') || chars.peek() == Some(&'|') {
                    chars.next();
                }
                if chars.peek() == Some(&'&') {
                    chars.next();
                    while chars
                        .peek()
                        .is_some_and(|ch| ch.is_ascii_digit() || *ch == '-')
                    {
                        chars.next();
                    }
                } else {
                    tokens.push(Token::WriteRedirect);
                }
            }
            '<' => {
                flush(&mut tokens, &mut word, &mut in_word);
                while chars.peek().is_some_and(|ch| matches!(ch, '<' | '-')) {
                    chars.next();
                }
                tokens.push(Token::ReadRedirect);
            }
            '&' => {
                flush(&mut tokens, &mut word, &mut in_word);
                if chars.peek() == Some(&'>') {
                    chars.next();
                    if chars.peek() == Some(&'>') {
                        chars.next();
                    }
                    tokens.push(Token::WriteRedirect);
                } else {
                    if chars.peek() == Some(&'&') {
                        chars.next();
                    }
                    tokens.push(Token::Separator);
                }
            }
            ';' | '|' | '(' | ')' | '\n' => {
                flush(&mut tokens, &mut word, &mut in_word);
                if c == '|' && chars.peek() == Some(&'|') {
                    chars.next();
                }
                tokens.push(Token::Separator);
            }
            c if c.is_whitespace() => flush(&mut tokens, &mut word, &mut in_word),
            other => {
                in_word = true;
                word.push(other);
            }
        }
    }
    flush(&mut tokens, &mut word, &mut in_word);

    tokens
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{analyze, tokenize, CommandShape, Token};

    fn targets(command: &str) -> Vec<String> {
        analyze(command).targets
    }

    #[test]
    fn tokenizer_respects_quotes_and_descriptor_redirects() {
        assert_eq!(
            tokenize(r#"echo "a > b" 2>/dev/null > 'out file.txt'"#),
            vec![
                Token::Word("echo".to_string()),
                Token::Word("a > b".to_string()),
                Token::WriteRedirect,
                Token::Word("/dev/null".to_string()),
                Token::WriteRedirect,
                Token::Word("out file.txt".to_string()),
            ]
        );
        assert_eq!(
            tokenize("make 2>&1 | tee log"),
            vec![
                Token::Word("make".to_string()),
                Token::Separator,
                Token::Word("tee".to_string()),
                Token::Word("log".to_string()),
            ]
        );
    }

    #[test]
    fn read_only_commands_are_not_mutating() {
        for command in [
            "ls -la",
            "cat src/main.rs | grep fn",
            "git status && git diff",
            "cargo metadata 2>/dev/null",
            "sed -n '1,5p' file.txt",
            "echo 'rm -rf x'",
        ] {
            assert_eq!(analyze(command), CommandShape::default(), "{command}");
        }
    }

    #[test]
    fn redirections_and_file_commands_name_their_targets() {
        assert_eq!(targets("echo hi > out.txt"), vec!["out.txt"]);
        assert_eq!(targets("echo hi >> logs/app.log"), vec!["logs/app.log"]);
        assert_eq!(targets("rm -f a.txt b.txt"), vec!["a.txt", "b.txt"]);
        assert_eq!(targets("FOO=1 sudo touch -c new.rs"), vec!["new.rs"]);
        assert_eq!(targets("chmod 644 script.sh"), vec!["script.sh"]);
        assert_eq!(targets("truncate -s 0 big.log"), vec!["big.log"]);
        assert_eq!(targets("sed -i 's/a/b/' src/lib.rs"), vec!["src/lib.rs"]);
        assert_eq!(targets("sed -i -e 's/a/b/' x.rs"), vec!["x.rs"]);
        assert_eq!(targets("bash -lc 'echo x > y.txt'"), vec!["y.txt"]);
    }

    #[test]
    fn copies_record_sources_and_destination() {
        let shape = analyze("cp -r a.txt b.txt dest/");
        assert!(shape.mutating);
        assert_eq!(
            shape.copies,
            vec![(
                vec!["a.txt".to_string(), "b.txt".to_string()],
                "dest/".to_string()
            )]
        );
    }

    #[test]
    fn implicit_or_dynamic_targets_are_unresolved() {
        for command in [
            "rm *.log",
            "git checkout -- .",
            "git reset --hard HEAD~1",
            "find . -name '*.tmp' -delete",
            "ls | xargs rm",
            "patch -p1 < fix.diff",
            "echo x > $OUT",
        ] {
            let shape = analyze(command);
            assert!(shape.mutating, "{command}");
            assert!(shape.unresolved, "{command}");
        }
    }
}
