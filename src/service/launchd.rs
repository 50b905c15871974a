//! macOS per-user launch agent.
use quick_xml::{
    Writer,
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::info;

use super::{
    CommandRunner, ServiceDescriptor, ServiceRegistrar, args, run_checked, run_lenient,
    show_raw_logs,
};
use crate::{constants::LAUNCHD_LABEL, error::ServiceRegistrationError};

const LAUNCHCTL: &str = "launchctl";
const PLIST_DOCTYPE: &str = r#"plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd""#;

pub struct LaunchdRegistrar {
    descriptor: ServiceDescriptor,
    agents_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl LaunchdRegistrar {
    pub fn new(descriptor: ServiceDescriptor, home: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            descriptor,
            agents_dir: home.join("Library/LaunchAgents"),
            runner,
        }
    }

    pub fn plist_path(&self) -> PathBuf {
        self.agents_dir.join(format!("{LAUNCHD_LABEL}.plist"))
    }
}

/// Renders the launch agent property list for `descriptor`.
pub fn render_plist(descriptor: &ServiceDescriptor) -> io::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    emit(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    )?;
    emit(
        &mut writer,
        Event::DocType(BytesText::from_escaped(PLIST_DOCTYPE)),
    )?;

    let mut plist = BytesStart::new("plist");
    plist.push_attribute(("version", "1.0"));
    emit(&mut writer, Event::Start(plist))?;
    emit(&mut writer, Event::Start(BytesStart::new("dict")))?;

    string_entry(&mut writer, "Label", LAUNCHD_LABEL)?;

    key(&mut writer, "ProgramArguments")?;
    emit(&mut writer, Event::Start(BytesStart::new("array")))?;
    for arg in descriptor.command_line() {
        text_element(&mut writer, "string", &arg)?;
    }
    emit(&mut writer, Event::End(BytesEnd::new("array")))?;

    string_entry(
        &mut writer,
        "WorkingDirectory",
        &descriptor.working_dir.display().to_string(),
    )?;
    bool_entry(&mut writer, "RunAtLoad", descriptor.auto_start)?;
    bool_entry(&mut writer, "KeepAlive", true)?;
    string_entry(&mut writer, "ProcessType", "Background")?;
    string_entry(
        &mut writer,
        "StandardOutPath",
        &descriptor.stdout_log_path.display().to_string(),
    )?;
    string_entry(
        &mut writer,
        "StandardErrorPath",
        &descriptor.stderr_log_path.display().to_string(),
    )?;

    emit(&mut writer, Event::End(BytesEnd::new("dict")))?;
    emit(&mut writer, Event::End(BytesEnd::new("plist")))?;

    let mut rendered = String::from_utf8(writer.into_inner()).map_err(io::Error::other)?;
    rendered.push('\n');
    Ok(rendered)
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> io::Result<()> {
    writer.write_event(event).map_err(io::Error::other)
}

fn text_element(writer: &mut Writer<Vec<u8>>, tag: &str, text: &str) -> io::Result<()> {
    emit(writer, Event::Start(BytesStart::new(tag)))?;
    emit(writer, Event::Text(BytesText::new(text)))?;
    emit(writer, Event::End(BytesEnd::new(tag)))
}

fn key(writer: &mut Writer<Vec<u8>>, name: &str) -> io::Result<()> {
    text_element(writer, "key", name)
}

fn string_entry(writer: &mut Writer<Vec<u8>>, name: &str, value: &str) -> io::Result<()> {
    key(writer, name)?;
    text_element(writer, "string", value)
}

fn bool_entry(writer: &mut Writer<Vec<u8>>, name: &str, value: bool) -> io::Result<()> {
    key(writer, name)?;
    let tag = if value { "true" } else { "false" };
    emit(writer, Event::Empty(BytesStart::new(tag)))
}

impl ServiceRegistrar for LaunchdRegistrar {
    fn platform(&self) -> &'static str {
        "launchd"
    }

    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn install(&self) -> Result<(), ServiceRegistrationError> {
        if !self.runner.is_available(LAUNCHCTL) {
            return Err(ServiceRegistrationError::ToolMissing {
                tool: LAUNCHCTL.to_string(),
                remediation: "launchctl ships with macOS; make sure /bin is on PATH and re-run \
                              `warden install`."
                    .to_string(),
            });
        }

        let plist_path = self.plist_path();
        let write_err = |source| ServiceRegistrationError::Write {
            path: plist_path.clone(),
            source,
        };
        fs::create_dir_all(&self.agents_dir).map_err(write_err)?;
        if let Some(log_dir) = self.descriptor.stdout_log_path.parent() {
            fs::create_dir_all(log_dir)?;
        }
        let plist = render_plist(&self.descriptor).map_err(write_err)?;
        fs::write(&plist_path, plist).map_err(write_err)?;
        info!("Wrote launch agent {}", plist_path.display());

        let runner = self.runner.as_ref();
        let path_arg = plist_path.display().to_string();
        run_lenient(runner, LAUNCHCTL, &args(["unload", path_arg.as_str()]));
        run_checked(runner, LAUNCHCTL, &args(["load", "-w", path_arg.as_str()]))?;

        info!("Loaded launch agent {LAUNCHD_LABEL}");
        Ok(())
    }

    fn uninstall(&self) -> Result<(), ServiceRegistrationError> {
        let plist_path = self.plist_path();
        if !plist_path.exists() {
            return Ok(());
        }

        if self.runner.is_available(LAUNCHCTL) {
            let path_arg = plist_path.display().to_string();
            run_lenient(
                self.runner.as_ref(),
                LAUNCHCTL,
                &args(["unload", "-w", path_arg.as_str()]),
            );
        }
        fs::remove_file(&plist_path).map_err(|source| ServiceRegistrationError::Write {
            path: plist_path.clone(),
            source,
        })?;
        info!("Removed launch agent {}", plist_path.display());
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.plist_path().is_file()
    }

    fn is_running(&self) -> bool {
        self.runner.is_available(LAUNCHCTL)
            && self
                .runner
                .run(LAUNCHCTL, &args(["list", LAUNCHD_LABEL]))
                .is_ok_and(|output| output.success && output.stdout.contains("\"PID\""))
    }

    fn show_logs(&self, follow: bool, lines: usize) -> Result<(), ServiceRegistrationError> {
        show_raw_logs(&self.descriptor, follow, lines)
    }
}
