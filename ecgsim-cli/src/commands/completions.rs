//! Shell completion generation and installation.

use {
    crate::Cli,
    anyhow::{Context, Result},
    clap::CommandFactory,
    clap_complete::{Shell, generate},
    console::style,
    directories::BaseDirs,
    std::{
        env, fs,
        io::{self, Write as _},
        path::{Path, PathBuf},
    },
};

/// Line that puts `~/.zfunc` on zsh's function path.
const ZSH_FPATH_LINE: &str = "fpath=(~/.zfunc $fpath)";

fn bin_name() -> String {
    Cli::command().get_name().to_string()
}

fn render(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    let name = bin_name();
    generate(shell, &mut cmd, name, out);
}

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    render(shell, &mut io::stdout());
}

/// Guess the user's shell from `$SHELL`, or PowerShell on Windows.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

fn shell_from_path(shell_path: &str) -> Option<Shell> {
    match Path::new(shell_path).file_name()?.to_str()? {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Where the completion script for `shell` goes under the given home,
/// config and data directories.
fn install_path(shell: Shell, home: &Path, config: &Path, data: &Path) -> Result<PathBuf> {
    let bin = bin_name();
    let path = match shell {
        Shell::Bash => data.join("bash-completion").join("completions").join(&bin),
        Shell::Zsh => home.join(".zfunc").join(format!("_{bin}")),
        Shell::Fish => config.join("fish").join("completions").join(format!("{bin}.fish")),
        Shell::Elvish => config.join("elvish").join("lib").join(format!("{bin}.elv")),
        Shell::PowerShell => env::var_os("PROFILE")
            .and_then(|profile| PathBuf::from(profile).parent().map(Path::to_path_buf))
            .unwrap_or_else(|| config.join("powershell").join("completions"))
            .join(format!("{bin}.ps1")),
        _ => anyhow::bail!("Unsupported shell for auto-install: {shell:?}"),
    };
    Ok(path)
}

/// What to tell the user after installing.
fn post_install_hint(shell: Shell, path: &Path) -> Vec<String> {
    match shell {
        Shell::Bash => vec![
            "Completions will be loaded automatically on new terminals.".to_string(),
            format!("To activate now: source {}", path.display()),
        ],
        Shell::Zsh => vec!["Restart your shell or run: exec zsh".to_string()],
        Shell::Fish | Shell::Elvish => {
            vec!["Completions will be loaded automatically on new sessions.".to_string()]
        },
        Shell::PowerShell => vec![
            "Add this to your PowerShell profile to load on startup:".to_string(),
            format!("  Import-Module {}", path.display()),
        ],
        _ => Vec::new(),
    }
}

/// Append the fpath line to `.zshrc` unless it is already there.
fn ensure_zsh_fpath(zshrc: &Path) -> Result<bool> {
    let present = fs::read_to_string(zshrc).is_ok_and(|content| content.contains(ZSH_FPATH_LINE));
    if present {
        return Ok(false);
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {} completions", bin_name())?;
    writeln!(file, "{ZSH_FPATH_LINE}")?;
    writeln!(file, "autoload -Uz compinit && compinit")?;
    Ok(true)
}

/// Install shell completions automatically.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(s) => s,
        None => detect_shell_type().with_context(|| {
            format!(
                "Could not detect your shell. Please specify it explicitly:\n  {} completions --install bash",
                bin_name()
            )
        })?,
    };

    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = install_path(shell, dirs.home_dir(), dirs.config_dir(), dirs.data_dir())?;

    let mut script = Vec::new();
    render(shell, &mut script);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &script)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(format!("{shell:?}")).cyan(),
        style(path.display()).yellow()
    );

    if shell == Shell::Zsh {
        let zshrc = dirs.home_dir().join(".zshrc");
        if ensure_zsh_fpath(&zshrc)? {
            eprintln!(
                "{} Added fpath to {}",
                style("✓").green().bold(),
                style(zshrc.display()).yellow()
            );
        }
    }

    let hint = post_install_hint(shell, &path);
    if !hint.is_empty() {
        eprintln!();
        for line in hint {
            eprintln!("{line}");
        }
    }

    Ok(())
}
