use lockmux::{
    Channel, Error, LockdownService,
    service::installation_proxy::{
        InstallError, InstallOptions, InstallationProxyClient, forward_to,
    },
};
use plist::{Dictionary, Value};
use tokio::{io::duplex, sync::mpsc, task::JoinHandle};

fn status(name: &str, percent: Option<u64>) -> Dictionary {
    let mut status = Dictionary::new();
    status.insert("Status".into(), name.into());
    if let Some(percent) = percent {
        status.insert("PercentComplete".into(), percent.into());
    }
    status
}

/// Answers one command with `replies`, returning the command it received
fn device(replies: Vec<Dictionary>) -> (InstallationProxyClient, JoinHandle<Dictionary>) {
    let (a, b) = duplex(64 * 1024);

    let task = tokio::spawn(async move {
        let mut channel = Channel::new(b);
        let command: Dictionary = channel.recv_plist().await.unwrap();
        for reply in replies {
            channel.send_plist(&reply).await.unwrap();
        }
        command
    });

    (InstallationProxyClient::from_channel(Channel::new(a)), task)
}

#[tokio::test]
async fn test_install_progress_is_monotonic() {
    let (mut client, task) = device(vec![
        status("CreatingStagingDirectory", Some(5)),
        status("ExtractingPackage", Some(15)),
        status("InspectingPackage", Some(10)),
        status("VerifyingApplication", None),
        status("InstallingApplication", Some(80)),
        status("Complete", None),
    ]);

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .install(
            "PublicStaging/app.ipa",
            &InstallOptions::default(),
            forward_to(tx),
        )
        .await
        .unwrap();

    let mut percents = Vec::new();
    while let Some(progress) = rx.recv().await {
        percents.push(progress.percent.unwrap());
    }
    assert_eq!(percents, [5, 15, 15, 15, 80]);
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));

    let command = task.await.unwrap();
    assert_eq!(
        command.get("Command").and_then(Value::as_string),
        Some("Install")
    );
    assert_eq!(
        command.get("PackagePath").and_then(Value::as_string),
        Some("PublicStaging/app.ipa")
    );
}

#[tokio::test]
async fn test_failure_is_the_only_terminal_result() {
    let mut failure = Dictionary::new();
    failure.insert("Error".into(), "APIInternalError".into());
    failure.insert("ErrorDescription".into(), "bad package".into());

    let (mut client, task) = device(vec![status("ExtractingPackage", Some(20)), failure]);

    let mut seen = Vec::new();
    let err = client
        .uninstall("com.example.app", &InstallOptions::default(), |p| {
            seen.push(p.status)
        })
        .await
        .unwrap_err();

    match err {
        Error::InstallStatus(status) => {
            assert_eq!(status.kind, InstallError::ApiInternalError);
            assert_eq!(status.details.as_deref(), Some("bad package"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(seen, ["ExtractingPackage"]);

    let command = task.await.unwrap();
    assert_eq!(
        command.get("ApplicationIdentifier").and_then(Value::as_string),
        Some("com.example.app")
    );
}

#[tokio::test]
async fn test_browse_collects_every_batch() {
    let app = |id: &str| {
        let mut app = Dictionary::new();
        app.insert("CFBundleIdentifier".into(), id.into());
        Value::Dictionary(app)
    };

    let mut first = status("BrowsingApplications", Some(50));
    first.insert("CurrentList".into(), Value::Array(vec![app("com.a")]));
    let mut second = status("BrowsingApplications", Some(100));
    second.insert("CurrentList".into(), Value::Array(vec![app("com.b")]));

    let (mut client, _task) = device(vec![first, second, status("Complete", None)]);

    let apps = client.browse(&InstallOptions::default()).await.unwrap();
    let ids: Vec<_> = apps
        .iter()
        .filter_map(|a| a.get("CFBundleIdentifier").and_then(Value::as_string))
        .collect();
    assert_eq!(ids, ["com.a", "com.b"]);
}
