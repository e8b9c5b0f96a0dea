//! Kindlepass command line
//!
//! Usage:
//!   kindlepass devices
//!   kindlepass activate --serial B008XXXXXXXXXXXX [--email you@example.com] [--locale uk] [--output FILE] [--device [--force]]
//!   kindlepass inspect /media/kindle/system/AudibleActivation.sys
//!
//! The password is read from `KINDLEPASS_PASSWORD` or prompted for.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kindlepass::api::{Challenge, Credentials};
use kindlepass::config::{ClientConfig, Locale};
use kindlepass::device::{DeviceResolver, DeviceSerial, StaticResolver, TargetDevice, UsbResolver};
use kindlepass::file;
use kindlepass::{ActivationOutcome, Activator, ChallengeHandler};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const PASSWORD_ENV: &str = "KINDLEPASS_PASSWORD";

#[derive(Parser, Debug)]
#[command(name = "kindlepass", version)]
#[command(about = "Audible activation for legacy Kindle readers")]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected readers
    Devices,

    /// Retrieve the activation for a reader
    Activate {
        /// Serial number as printed on the device
        #[arg(short, long)]
        serial: String,

        /// Account e-mail (prompted for when missing)
        #[arg(short, long)]
        email: Option<String>,

        /// Marketplace country code (us, uk, de, ...)
        #[arg(short, long)]
        locale: Option<String>,

        /// Where to save the license file
        #[arg(short, long, conflicts_with = "device")]
        output: Option<PathBuf>,

        /// Write the license to the connected reader with this serial
        #[arg(short, long)]
        device: bool,

        /// Request a new activation even if the reader already has one
        #[arg(short, long, requires = "device")]
        force: bool,
    },

    /// Print the activation bytes of an existing license file
    Inspect {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "kindlepass=debug" } else { "kindlepass=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_target(false)
        .compact()
        .init();

    let config = match &cli.config {
        Some(path) => ClientConfig::load(path),
        None => ClientConfig::load_default(),
    }
    .context("Failed to load config")?;

    match cli.command {
        Command::Devices => list_devices(&config),
        Command::Activate {
            serial,
            email,
            locale,
            output,
            device,
            force,
        } => activate(config, &serial, email, locale, output, device, force).await,
        Command::Inspect { path } => inspect(&path),
    }
}

fn list_devices(config: &ClientConfig) -> Result<()> {
    let devices = candidates(config)?;
    if devices.is_empty() {
        println!("No readers found. Connect a Kindle over USB and mount its storage.");
        return Ok(());
    }

    println!("{:<20} {:<20} {:<10} Mount point", "Model", "Serial", "Activated");
    for device in devices {
        println!(
            "{:<20} {:<20} {:<10} {}",
            device.model(),
            device.serial,
            if device.is_activated() { "yes" } else { "no" },
            device.mount_point.display()
        );
    }
    Ok(())
}

async fn activate(
    mut config: ClientConfig,
    serial: &str,
    email: Option<String>,
    locale: Option<String>,
    output: Option<PathBuf>,
    to_device: bool,
    force: bool,
) -> Result<()> {
    if let Some(code) = locale {
        config.locale = Locale::from_country_code(&code)?.country_code;
    }
    config.validate()?;

    let serial = DeviceSerial::parse(serial)?;
    println!("{} ({})", serial, serial.model());

    let target = if to_device {
        Some(find_device(&config, &serial)?)
    } else {
        None
    };

    let email = match email {
        Some(email) => email,
        None => prompt("E-mail: ")?,
    };
    let password = read_password()?;
    let credentials = Credentials::new(email, password)?;

    let activator = Activator::new(config);
    let mut handler = TerminalHandler;

    let (outcome, path) = match target {
        Some(target) => {
            if !force && target.is_activated() {
                println!("{} already has an activation; pass --force to request a new one.", target.serial);
            }
            activator.activate_device(credentials, &target, force, &mut handler).await?
        }
        None => {
            let outcome = activator.run(credentials, serial.clone(), &mut handler).await?;
            let path = match output {
                Some(path) => path,
                None => file::default_save_path(&serial)?,
            };
            file::save_license_to(&path, &outcome.license)?;
            (outcome, path)
        }
    };

    println!();
    println!("Activation bytes: {}", outcome.activation_bytes);
    println!("License file:     {}", path.display());
    Ok(())
}

fn inspect(path: &std::path::Path) -> Result<()> {
    let outcome = ActivationOutcome::from_license_path(path)
        .with_context(|| format!("Failed to decode {}", path.display()))?;

    if let Some(serial) = outcome.record.device_serial() {
        println!("Serial:           {}", serial);
    }
    println!("Groups:           {}", outcome.record.groups().len());
    println!("Activation bytes: {}", outcome.activation_bytes);
    Ok(())
}

/// Devices from the config file first, then attached readers
fn candidates(config: &ClientConfig) -> Result<Vec<TargetDevice>> {
    let mut devices = StaticResolver::from_entries(&config.devices)?.candidates()?;
    for device in UsbResolver::default().candidates()? {
        if !devices.iter().any(|d| d.serial == device.serial) {
            devices.push(device);
        }
    }
    debug!(count = devices.len(), "Device candidates");
    Ok(devices)
}

fn find_device(config: &ClientConfig, serial: &DeviceSerial) -> Result<TargetDevice> {
    let device = candidates(config)?.into_iter().find(|d| &d.serial == serial);
    match device {
        Some(device) => {
            info!(mount = %device.mount_point.display(), "Found reader");
            Ok(device)
        }
        None => bail!(
            "No mounted reader with serial {}. Connect it over USB, or omit --device to save the file locally.",
            serial
        ),
    }
}

/// `KINDLEPASS_PASSWORD`, or a prompt that does not echo
fn read_password() -> Result<String> {
    match std::env::var(PASSWORD_ENV) {
        Ok(password) if !password.is_empty() => Ok(password),
        _ => rpassword::prompt_password("Password: ").context("Failed to read password"),
    }
}

fn prompt(message: &str) -> Result<String> {
    print!("{}", message);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().lock().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// Asks on the terminal; an empty answer abandons the activation
struct TerminalHandler;

impl TerminalHandler {
    fn ask(&self, message: &str) -> Option<String> {
        let answer = prompt(message).ok()?;
        if answer.is_empty() {
            None
        } else {
            Some(answer)
        }
    }

    /// The image file lives until the returned handle is dropped
    fn save_captcha(image: &[u8]) -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("kindlepass-captcha-")
            .suffix(".jpg")
            .tempfile()?;
        file.write_all(image)?;
        file.flush()?;
        Ok(file)
    }
}

impl ChallengeHandler for TerminalHandler {
    fn respond(&mut self, challenge: &Challenge) -> Option<String> {
        println!();
        match challenge {
            Challenge::Captcha {
                image,
                image_url,
                prompt,
                ..
            } => {
                println!("{}", prompt);
                let saved = match Self::save_captcha(image) {
                    Ok(file) => {
                        println!("CAPTCHA image saved to {}", file.path().display());
                        Some(file)
                    }
                    Err(e) => {
                        println!("Could not save CAPTCHA image ({}); open {}", e, image_url);
                        None
                    }
                };
                let answer = self.ask("Characters shown in the image: ");
                drop(saved);
                answer
            }
            Challenge::OneTimePasscode { prompt, .. } => {
                println!("{}", prompt);
                self.ask("Code: ")
            }
            Challenge::ChooseVerificationMethod { prompt, options, .. } => {
                println!("{}", prompt);
                for (i, option) in options.iter().enumerate() {
                    println!("  {}) {}", i + 1, option.label);
                }
                let answer = self.ask("Option: ")?;
                let chosen = answer
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| options.get(i))
                    .map(|o| o.value.clone());
                Some(chosen.unwrap_or(answer))
            }
            Challenge::UnexpectedRedirect { url, .. } => {
                println!("The provider wants to continue in a browser. Open:");
                println!("  {}", url);
                println!("Finish the steps there, then paste the address of the page you end up on.");
                self.ask("Final URL: ")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_requires_device() {
        let cli = Cli::try_parse_from(["kindlepass", "activate", "--serial", "B008XXXXXXXXXXXX", "--device", "--force"])
            .unwrap();
        match cli.command {
            Command::Activate { device, force, .. } => assert!(device && force),
            other => panic!("unexpected command: {:?}", other),
        }

        assert!(Cli::try_parse_from(["kindlepass", "activate", "--serial", "B008XXXXXXXXXXXX", "--force"]).is_err());
        println!("✅ --force only with --device");
    }

    #[test]
    fn test_captcha_image_removed_after_answer() {
        let file = TerminalHandler::save_captcha(&[0xFF, 0xD8, 0xFF]).unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0xFF, 0xD8, 0xFF]);

        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_password_from_environment() {
        std::env::set_var(PASSWORD_ENV, "hunter2");
        assert_eq!(read_password().unwrap(), "hunter2");
        std::env::remove_var(PASSWORD_ENV);
    }
}
