use crate::config::{BuilderSettings, ProxySettings};
use crate::error::{Error, Result};
use crate::executor::{Executor, RunOptions, to_args};
use crate::signer::Signer;

/// Location of the pre-checked-out web + native wrapper template.
pub const TEMPLATE_DIR: &str = "/app/packages/android-app";
pub const SCRATCH_HTML_PATH: &str = "public/scratch.html";
pub const ICON_PATH: &str = "assets/icon-only.png";
pub const NATIVE_PROJECT_DIR: &str = "android";
pub const APK_RELEASE_OUTPUT_PATH: &str =
    "./android/app/build/outputs/apk/release/app-release-unsigned.apk";
pub const APK_RELEASE_SIGNED_OUTPUT_PATH: &str =
    "./android/app/build/outputs/apk/release/app-release.apk";

/// Identity the package is built under. `app_id` is trusted to be a valid
/// Android package name.
#[derive(Debug, Clone)]
pub struct AppIdentity {
    pub app_id: String,
    pub app_name: String,
    pub scratch_html: String,
    pub icon: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct BuilderOptions {
    /// Forbid dependency resolution over the network.
    pub offline: bool,
    pub proxy: Option<ProxySettings>,
    /// Overrides [`TEMPLATE_DIR`].
    pub template_dir: Option<String>,
}

impl From<&BuilderSettings> for BuilderOptions {
    fn from(s: &BuilderSettings) -> Self {
        Self {
            offline: s.offline,
            proxy: s.proxy.clone(),
            template_dir: Some(s.template_dir.clone()),
        }
    }
}

/// Drives the template project through web build, native sync, release
/// assembly and signing inside one execution backend.
pub struct Packager<'a> {
    options: BuilderOptions,
    exec: &'a mut dyn Executor,
}

impl<'a> Packager<'a> {
    pub fn new(options: BuilderOptions, exec: &'a mut dyn Executor) -> Self {
        Self { options, exec }
    }

    /// The backend this packager drives; files written through it land beside the build.
    pub fn executor(&self) -> &dyn Executor {
        &*self.exec
    }

    pub fn template_dir(&self) -> &str {
        self.options.template_dir.as_deref().unwrap_or(TEMPLATE_DIR)
    }

    pub fn init(&mut self, app: &AppIdentity) -> Result<()> {
        let template = self.template_dir().to_string();
        self.exec.set_workdir(&template);

        self.exec
            .write_file(SCRATCH_HTML_PATH, app.scratch_html.as_bytes())?;
        if let Some(icon) = app.icon.as_deref() {
            self.exec.write_file(ICON_PATH, icon)?;
        }

        let env = RunOptions::default()
            .with_env("APP_ID", &app.app_id)
            .with_env("APP_NAME", &app.app_name);

        tracing::info!(app_id = %app.app_id, template = %template, "building web bundle");
        self.exec.run("pnpm", &to_args(["build"]), &env)?;
        self.exec
            .run("npx", &to_args(["cap", "add", NATIVE_PROJECT_DIR]), &env)?;
        self.exec
            .run("npx", &to_args(["cap", "sync", NATIVE_PROJECT_DIR]), &env)?;
        if app.icon.is_some() {
            self.exec.run(
                "npx",
                &to_args(["capacitor-assets", "generate", "--android"]),
                &env,
            )?;
        }
        Ok(())
    }

    pub fn gradle_args(&self) -> Vec<String> {
        let mut args = to_args(["assembleRelease", "--no-daemon"]);
        if self.options.offline {
            args.push("--offline".into());
        }
        if let Some(proxy) = &self.options.proxy {
            for scheme in ["http", "https"] {
                args.push(format!("-D{scheme}.proxyHost={}", proxy.host));
                args.push(format!("-D{scheme}.proxyPort={}", proxy.port));
            }
        }
        args
    }

    /// Assembles the unsigned release APK at [`APK_RELEASE_OUTPUT_PATH`].
    pub fn build(&mut self) -> Result<()> {
        let native_dir = format!("{}/{NATIVE_PROJECT_DIR}", self.template_dir());
        let args = self.gradle_args();
        tracing::info!(offline = self.options.offline, "assembling release");
        self.exec
            .run("./gradlew", &args, &RunOptions::in_dir(native_dir))
            .map_err(|e| match e {
                e @ Error::CommandFailed { .. } => Error::BuildFailed(Box::new(e)),
                other => other,
            })
    }

    /// Signs the unsigned release output and returns the signed bytes.
    pub fn sign(&mut self, signer: &Signer) -> Result<Vec<u8>> {
        signer.sign_apk(
            &*self.exec,
            APK_RELEASE_OUTPUT_PATH,
            APK_RELEASE_SIGNED_OUTPUT_PATH,
        )?;
        self.exec.read_file(APK_RELEASE_SIGNED_OUTPUT_PATH)
    }

    /// Drops the generated native project so the template can be synced again.
    pub fn clear(&mut self) -> Result<()> {
        self.exec.remove(&format!("./{NATIVE_PROJECT_DIR}"))
    }
}
