//! Interactive REPL: one persistent [`wisp_runtime::Interpreter`] across
//! lines, so a runtime error on one line doesn't lose globals or classes
//! defined on earlier lines — base-spec §8 scenario 6 ("subsequent calls
//! succeed after a recoverable runtime error in the same session").
//!
//! Grounded on `atlas-cli`'s choice of `rustyline` for line editing and
//! `dirs` for locating a history file; the teacher's own REPL additionally
//! threads a type-checker and debugger state through each line, neither of
//! which applies here, so this keeps only the line-editing and
//! persistent-interpreter shape.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use wisp_runtime::Interpreter;

fn history_path() -> Option<std::path::PathBuf> {
    dirs::home_dir().map(|home| home.join(".wisp_history"))
}

pub fn run() {
    let mut interpreter = Interpreter::new();
    let mut editor = DefaultEditor::new().expect("terminal line editor failed to initialize");
    let history = history_path();
    if let Some(path) = &history {
        let _ = editor.load_history(path);
    }

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                let mut stdout = std::io::stdout();
                let mut stderr = std::io::stderr();
                interpreter.interpret(&line, &mut stdout, &mut stderr);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Readline error: {err}");
                break;
            }
        }
    }

    if let Some(path) = &history {
        let _ = editor.save_history(path);
    }
}
