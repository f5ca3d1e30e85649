//! Structured notifications and mail delivery.
//!
//! Three event kinds, each a pure function of the state at emission: a
//! warning when a user moves into or up in penalty, an all-clear when the
//! authoritative host releases them, and a node-wide high usage alert for
//! administrators. Delivery goes through the `Mailer` trait; notifications
//! are best-effort and never retried synchronously.

use crate::collector::sampler::{StaticProcess, Usage};
use crate::config::EmailConfig;
use lettre::message::header::ContentType;
use lettre::{Message, SmtpTransport, Transport};
use std::fmt;
use std::sync::Mutex;
use tracing::warn;

/// Error type for notification failures.
#[derive(Debug)]
pub enum NotifyError {
    /// The message could not be built (bad addresses).
    Compose(String),
    /// The transport refused the message.
    Send(String),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::Compose(msg) => write!(f, "compose error: {}", msg),
            NotifyError::Send(msg) => write!(f, "send error: {}", msg),
        }
    }
}

impl std::error::Error for NotifyError {}

/// A user moved into or up in penalty.
#[derive(Debug, Clone)]
pub struct WarnNotice {
    pub uid: u32,
    pub username: String,
    pub hostname: String,
    /// The penalty group's severity label.
    pub severity: String,
    pub status_group: String,
    /// Quotas before the penalty (cpu % of core, mem % of machine).
    pub prev_quotas: Usage,
    pub new_quotas: Usage,
    /// Epoch seconds when the badness that led here started.
    pub badness_started: i64,
    /// Minutes the penalty lasts.
    pub penalty_minutes: u64,
    /// Hosts in the sync group where the quotas will apply.
    pub hosts: Vec<String>,
    /// Top processes over the recent history, merged by name.
    pub top_processes: Vec<StaticProcess>,
}

/// A user returned to their default group from penalty.
#[derive(Debug, Clone)]
pub struct NiceNotice {
    pub uid: u32,
    pub username: String,
    pub hostname: String,
    pub status_group: String,
}

/// Aggregate usage across all users stayed above thresholds.
#[derive(Debug, Clone)]
pub struct HighUsageNotice {
    pub hostname: String,
    pub usage: Usage,
    /// "uid (username)" with usage, highest relative usage first.
    pub top_users: Vec<(String, Usage)>,
}

/// An outbound mail, transport-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMail {
    pub subject: String,
    pub body: String,
    pub to: Vec<String>,
    pub bcc: Vec<String>,
    pub from: String,
    pub reply_to: String,
    /// Deliver via the local MTA instead of the configured server, for
    /// `user@localhost` spool recipients.
    pub localhost: bool,
}

/// Mail delivery seam.
pub trait Mailer: Send + Sync {
    fn send(&self, mail: &OutboundMail) -> Result<(), NotifyError>;
}

/// SMTP delivery through the configured mail server.
pub struct SmtpMailer {
    mail_server: String,
}

impl SmtpMailer {
    pub fn new(mail_server: impl Into<String>) -> Self {
        Self {
            mail_server: mail_server.into(),
        }
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, mail: &OutboundMail) -> Result<(), NotifyError> {
        let mut builder = Message::builder()
            .from(
                mail.from
                    .parse()
                    .map_err(|_| NotifyError::Compose(format!("bad from: {}", mail.from)))?,
            )
            .subject(&mail.subject)
            .header(ContentType::TEXT_HTML);
        for to in &mail.to {
            builder = builder.to(to
                .parse()
                .map_err(|_| NotifyError::Compose(format!("bad recipient: {to}")))?);
        }
        for bcc in &mail.bcc {
            builder = builder.bcc(bcc
                .parse()
                .map_err(|_| NotifyError::Compose(format!("bad bcc: {bcc}")))?);
        }
        if !mail.reply_to.is_empty() {
            builder = builder.reply_to(
                mail.reply_to
                    .parse()
                    .map_err(|_| NotifyError::Compose(format!("bad reply-to: {}", mail.reply_to)))?,
            );
        }
        let message = builder
            .body(mail.body.clone())
            .map_err(|e| NotifyError::Compose(e.to_string()))?;

        let server = if mail.localhost {
            "localhost"
        } else {
            self.mail_server.as_str()
        };
        let transport = SmtpTransport::builder_dangerous(server).build();
        transport
            .send(&message)
            .map(|_| ())
            .map_err(|e| NotifyError::Send(e.to_string()))
    }
}

/// Mailer that records messages instead of sending; tests only.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<OutboundMail>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .map(|sent| sent.iter().map(|m| m.subject.clone()).collect())
            .unwrap_or_default()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, mail: &OutboundMail) -> Result<(), NotifyError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(mail.clone());
        }
        Ok(())
    }
}

/// Builds and delivers notifications per the email configuration.
pub struct Notifier<M: Mailer> {
    email: EmailConfig,
    debug_mode: bool,
    mailer: M,
}

impl<M: Mailer> Notifier<M> {
    pub fn new(email: EmailConfig, debug_mode: bool, mailer: M) -> Self {
        Self {
            email,
            debug_mode,
            mailer,
        }
    }

    pub fn mailer(&self) -> &M {
        &self.mailer
    }

    /// Resolves a user's notification address. Lacking a directory, mail
    /// goes to `username@localhost` for spool delivery.
    fn user_address(&self, username: &str) -> String {
        format!("{username}@localhost")
    }

    /// Recipients for a user-facing notice. In debug mode everything is
    /// redirected to the administrators.
    fn user_recipients(&self, username: &str) -> (Vec<String>, Vec<String>) {
        if self.debug_mode {
            (self.email.admin_emails.clone(), Vec::new())
        } else {
            (
                vec![self.user_address(username)],
                self.email.admin_emails.clone(),
            )
        }
    }

    fn deliver(&self, mail: OutboundMail) {
        if mail.to.is_empty() && mail.bcc.is_empty() {
            return;
        }
        if let Err(err) = self.mailer.send(&mail) {
            warn!(error = %err, "unable to send notification");
        }
    }

    /// Emits a penalty warning to the user.
    pub fn warn(&self, notice: &WarnNotice) {
        let (to, bcc) = self.user_recipients(&notice.username);
        let localhost = to.iter().any(|addr| addr.ends_with("@localhost"));
        let subject = format!(
            "Violation of usage policy by {} ({}) on {}",
            notice.username, notice.severity, notice.hostname
        );

        let cpu_pct_of_prev = if notice.prev_quotas.cpu > 0.0 {
            (notice.new_quotas.cpu / notice.prev_quotas.cpu * 100.0).round()
        } else {
            100.0
        };
        let mem_pct_of_prev = if notice.prev_quotas.mem > 0.0 {
            (notice.new_quotas.mem / notice.prev_quotas.mem * 100.0).round()
        } else {
            100.0
        };

        let mut body = format!(
            "<p>Your usage on {} exceeded its limits starting at {} and your \
             status is now <b>{}</b>: your CPU quota is reduced to {:.0}% and \
             your memory quota to {:.0}% of normal for {} minutes.</p>",
            notice.hostname,
            format_epoch(notice.badness_started),
            notice.status_group,
            cpu_pct_of_prev,
            mem_pct_of_prev,
            notice.penalty_minutes,
        );
        if notice.hosts.len() > 1 {
            body.push_str(&format!(
                "<p>These limits apply on {}.</p>",
                fold_hostlist(&notice.hosts)
            ));
        }
        body.push_str(&process_table(&notice.top_processes));

        self.deliver(OutboundMail {
            subject,
            body,
            to,
            bcc,
            from: self.email.from_email.clone(),
            reply_to: self.email.reply_to.clone(),
            localhost,
        });
    }

    /// Emits the all-clear once a penalty has timed out. Callers must only
    /// invoke this on the authoritative host.
    pub fn nice(&self, notice: &NiceNotice) {
        let (to, bcc) = self.user_recipients(&notice.username);
        let localhost = to.iter().any(|addr| addr.ends_with("@localhost"));
        let subject = format!(
            "Usage policy clear for {} on {}",
            notice.username, notice.hostname
        );
        let body = format!(
            "<p>Your penalty on {} has timed out; your status is back to \
             <b>{}</b> and normal limits apply again.</p>",
            notice.hostname, notice.status_group
        );
        self.deliver(OutboundMail {
            subject,
            body,
            to,
            bcc,
            from: self.email.from_email.clone(),
            reply_to: self.email.reply_to.clone(),
            localhost,
        });
    }

    /// Emits a node-wide high usage alert to administrators.
    pub fn high_usage(&self, notice: &HighUsageNotice) {
        let subject = format!("High usage on {}", notice.hostname);
        let mut body = format!(
            "<p>Overall usage on {}: cpu {:.1}%, mem {:.1}%.</p><table>\
             <tr><td>User</td><td>CPU (%)</td><td>Memory (%)</td></tr>",
            notice.hostname, notice.usage.cpu, notice.usage.mem
        );
        for (name, usage) in &notice.top_users {
            body.push_str(&format!(
                "<tr><td>{}</td><td>{:.2}</td><td>{:.2}</td></tr>",
                name, usage.cpu, usage.mem
            ));
        }
        body.push_str("</table>");
        self.deliver(OutboundMail {
            subject,
            body,
            to: self.email.admin_emails.clone(),
            bcc: Vec::new(),
            from: self.email.from_email.clone(),
            reply_to: String::new(),
            localhost: false,
        });
    }
}

fn format_epoch(epoch: i64) -> String {
    chrono::DateTime::from_timestamp(epoch, 0)
        .map(|dt| dt.format("%H:%M on %m/%d").to_string())
        .unwrap_or_else(|| epoch.to_string())
}

/// Renders the top-processes table.
fn process_table(procs: &[StaticProcess]) -> String {
    let mut table = String::from(
        "<table><tr><td>Process</td><td>Average core usage (%)</td>\
         <td>Average memory usage (%)</td></tr>",
    );
    for proc in procs {
        table.push_str(&format!(
            "<tr><td>{} ({})</td><td>{:.2}</td><td>{:.2}</td></tr>",
            proc.name, proc.count, proc.usage.cpu, proc.usage.mem
        ));
    }
    table.push_str("</table>");
    table
}

/// Folds a host list into cluster-range notation: consecutive numeric
/// suffixes become `prefix[a-b]`, scattered ones `prefix{a,c}`, and
/// non-numeric names pass through verbatim.
pub fn fold_hostlist(hosts: &[String]) -> String {
    let mut groups: Vec<(String, Vec<u64>)> = Vec::new();
    let mut plain: Vec<String> = Vec::new();

    let mut sorted: Vec<&String> = hosts.iter().collect();
    sorted.sort();
    sorted.dedup();

    for host in sorted {
        let split = host.rfind(|c: char| !c.is_ascii_digit());
        let (prefix, digits) = match split {
            Some(i) if i + 1 < host.len() => (&host[..=i], &host[i + 1..]),
            None if !host.is_empty() => ("", host.as_str()),
            _ => {
                plain.push(host.clone());
                continue;
            }
        };
        match digits.parse::<u64>() {
            Ok(number) => {
                if let Some((_, numbers)) = groups.iter_mut().find(|(p, _)| p == prefix) {
                    numbers.push(number);
                } else {
                    groups.push((prefix.to_string(), vec![number]));
                }
            }
            Err(_) => plain.push(host.clone()),
        }
    }

    let mut parts: Vec<String> = Vec::new();
    for (prefix, mut numbers) in groups {
        numbers.sort_unstable();
        numbers.dedup();
        if numbers.len() == 1 {
            parts.push(format!("{}{}", prefix, numbers[0]));
        } else if numbers.windows(2).all(|w| w[1] == w[0] + 1) {
            parts.push(format!("{}[{}-{}]", prefix, numbers[0], numbers[numbers.len() - 1]));
        } else {
            let list: Vec<String> = numbers.iter().map(u64::to_string).collect();
            parts.push(format!("{}{{{}}}", prefix, list.join(",")));
        }
    }
    parts.extend(plain);
    parts.join(", ")
}
