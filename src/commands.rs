//! CLI subcommand implementations for keyper.
//!
//! Commands take an [`AuthContext`] by reference and print user feedback;
//! they return `Err` only for failures the user must act on, which the
//! binary turns into a non-zero exit.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::constants::WRITE_SETTLE_TIMEOUT;
use crate::context::AuthContext;

/// How long commands wait for the initial session read before reporting
/// state. Generous; the read is local storage, not network.
const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Signs in and persists the session token.
///
/// Reads the password from stdin when not supplied as an argument.
///
/// # Errors
///
/// Returns an error when the credentials are rejected or the server is
/// unreachable.
pub fn login(ctx: &AuthContext, username: &str, password: Option<&str>) -> Result<()> {
    let password = match password {
        Some(password) => password.to_string(),
        None => prompt_password()?,
    };

    let profile = ctx.sign_in(username, &password)?;
    if !ctx.flush(WRITE_SETTLE_TIMEOUT) {
        println!("Warning: the session token may not have been stored; you may need to sign in again.");
    }

    match profile {
        Some(profile) => println!(
            "Signed in as {}.",
            profile.display_name.as_deref().unwrap_or(&profile.username)
        ),
        None => println!("Signed in as {}.", username),
    }
    Ok(())
}

/// Signs out and deletes the persisted session token.
pub fn logout(ctx: &AuthContext) -> Result<()> {
    ctx.wait_ready(READY_TIMEOUT);

    if ctx.session().is_none() {
        println!("Not signed in.");
        return Ok(());
    }

    ctx.sign_out();
    if !ctx.flush(WRITE_SETTLE_TIMEOUT) {
        println!("Warning: the stored session token may not have been removed; check the logs.");
    }
    println!("Signed out.");
    Ok(())
}

/// Prints the profile for the stored session.
///
/// # Errors
///
/// Returns an error when not signed in or the stored token is rejected.
pub fn whoami(ctx: &AuthContext) -> Result<()> {
    ctx.wait_ready(READY_TIMEOUT);

    let profile = ctx.profile()?;
    println!("{}", profile.username);
    if let Some(display_name) = profile.display_name {
        println!("  name:  {}", display_name);
    }
    if let Some(email) = profile.email {
        println!("  email: {}", email);
    }
    Ok(())
}

/// Prints the session state and the storage backend in use.
pub fn status(ctx: &AuthContext) -> Result<()> {
    let ready = ctx.wait_ready(READY_TIMEOUT);

    let state = if !ready {
        "loading".to_string()
    } else {
        match ctx.session() {
            Some(session) => match session.username {
                Some(username) => format!("signed in as {username}"),
                None => "signed in".to_string(),
            },
            None => "signed out".to_string(),
        }
    };

    println!("Session: {}", state);
    println!("Storage: {}", ctx.store_name());
    Ok(())
}

fn prompt_password() -> Result<String> {
    print!("Password: ");
    io::stdout().flush()?;

    let mut password = String::new();
    io::stdin()
        .lock()
        .read_line(&mut password)
        .context("reading password from stdin")?;
    Ok(password.trim_end_matches(['\r', '\n']).to_string())
}
