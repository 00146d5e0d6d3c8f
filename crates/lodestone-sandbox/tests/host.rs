//! End-to-end behavior of a host running sandbox instances.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lodestone_core::{
    CausedBy, ConfigurableValue, DotLodestoneConfig, ErrorKind, ExitStatus, GameType,
    InstanceUuid, Result, SetupValue, State,
};
use lodestone_events::{
    EventBroadcaster, EventInner, Ingest, InstanceEventInner, NotificationCenter,
    NotificationState,
};
use lodestone_protocol::{ProcedureCall, ProcedureCallInner, ProcedureCallResultInner};
use lodestone_sandbox::{GAME_TYPE, SandboxFactory, SandboxTimings};
use lodestone_supervisor::{DispatchConfig, HandlerRegistry, Supervisor};

fn host() -> Supervisor {
    let factory = SandboxFactory::with_timings(SandboxTimings {
        stage_delay: Duration::from_millis(20),
    });
    let registry = HandlerRegistry::new().with_factory(Arc::new(factory));
    let config = DispatchConfig::default()
        .with_call_timeout(Duration::from_secs(5))
        .with_lifecycle_timeout(Duration::from_secs(10));
    Supervisor::new(registry, Arc::new(EventBroadcaster::new(1024)), config)
}

fn steve() -> CausedBy {
    CausedBy::User {
        user_id: "u-1".to_string(),
        user_name: "steve".to_string(),
    }
}

async fn call(host: &Supervisor, inner: ProcedureCallInner) -> Result<ProcedureCallResultInner> {
    host.dispatch(ProcedureCall::new(1, inner)).await.into_result()
}

async fn create(host: &Supervisor, dir: &Path, name: &str, restart_on_crash: bool) -> InstanceUuid {
    let uuid = InstanceUuid::new();
    call(
        host,
        ProcedureCallInner::SetupInstance {
            dot_lodestone_config: DotLodestoneConfig::new(uuid, GameType::new(GAME_TYPE)),
            setup_value: SetupValue {
                name: name.to_string(),
                description: None,
                port: 25565,
                auto_start: true,
                restart_on_crash,
                setting_sections: Default::default(),
            },
            path: dir.join(name),
        },
    )
    .await
    .unwrap();
    uuid
}

async fn start(host: &Supervisor, uuid: InstanceUuid, block: bool) -> ProcedureCallResultInner {
    call(
        host,
        ProcedureCallInner::StartInstance {
            instance_uuid: uuid,
            caused_by: steve(),
            block,
        },
    )
    .await
    .unwrap()
}

async fn wait_for_state(host: &Supervisor, uuid: InstanceUuid, want: State) {
    let mut rx = host.watch_state(uuid).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .expect("state never reached")
        .unwrap();
}

async fn setting(
    host: &Supervisor,
    uuid: InstanceUuid,
    section_id: &str,
    setting_id: &str,
) -> Option<ConfigurableValue> {
    let reply = call(
        host,
        ProcedureCallInner::GetConfigurableManifest {
            instance_uuid: uuid,
        },
    )
    .await
    .unwrap();
    let ProcedureCallResultInner::ConfigurableManifest(manifest) = reply else {
        panic!("unexpected reply {reply:?}");
    };
    manifest
        .setting(section_id, setting_id)
        .unwrap()
        .effective_value()
        .cloned()
}

fn update(uuid: InstanceUuid, section: &str, setting: &str, value: ConfigurableValue) -> ProcedureCallInner {
    ProcedureCallInner::UpdateConfigurable {
        instance_uuid: uuid,
        section_id: section.to_string(),
        setting_id: setting.to_string(),
        new_value: value,
    }
}

#[tokio::test]
async fn immutable_setting_cannot_change() {
    let dir = tempfile::tempdir().unwrap();
    let host = host();
    let uuid = create(&host, dir.path(), "survival", false).await;

    let err = call(
        &host,
        update(uuid, "server", "level_seed", ConfigurableValue::String("other".to_string())),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::PermissionDenied);
    assert_eq!(
        setting(&host, uuid, "server", "level_seed").await,
        Some(ConfigurableValue::String("lodestone".to_string()))
    );
}

#[tokio::test]
async fn regex_setting_is_checked() {
    let dir = tempfile::tempdir().unwrap();
    let host = host();
    let uuid = create(&host, dir.path(), "survival", false).await;
    let before = setting(&host, uuid, "server", "motd").await;

    let err = call(
        &host,
        update(uuid, "server", "motd", ConfigurableValue::String("two\nlines".to_string())),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidInput);
    assert_eq!(setting(&host, uuid, "server", "motd").await, before);

    call(
        &host,
        update(uuid, "server", "motd", ConfigurableValue::String("Welcome back".to_string())),
    )
    .await
    .unwrap();
    assert_eq!(
        setting(&host, uuid, "server", "motd").await,
        Some(ConfigurableValue::String("Welcome back".to_string()))
    );
}

#[tokio::test]
async fn secrets_stay_out_of_results_and_events() {
    let dir = tempfile::tempdir().unwrap();
    let host = host();
    let uuid = create(&host, dir.path(), "survival", false).await;

    call(
        &host,
        update(uuid, "rcon", "rcon_password", ConfigurableValue::String("correct-horse".to_string())),
    )
    .await
    .unwrap();

    assert_eq!(setting(&host, uuid, "rcon", "rcon_password").await, None);
    let changed = host
        .events()
        .buffered(None)
        .into_iter()
        .find_map(|event| match event.event_inner {
            EventInner::InstanceEvent(e) => match e.instance_event_inner {
                InstanceEventInner::SettingChanged {
                    setting_id, value, ..
                } if setting_id == "rcon_password" => Some(value),
                _ => None,
            },
            _ => None,
        })
        .expect("no SettingChanged event");
    assert_eq!(changed, None);
}

#[tokio::test]
async fn blocking_start_waits_for_running() {
    let dir = tempfile::tempdir().unwrap();
    let host = host();
    let uuid = create(&host, dir.path(), "survival", false).await;

    assert_eq!(
        start(&host, uuid, true).await,
        ProcedureCallResultInner::State(State::Running)
    );
    assert_eq!(host.state(uuid).await.unwrap(), State::Running);
}

#[tokio::test]
async fn non_blocking_start_returns_early() {
    let dir = tempfile::tempdir().unwrap();
    let host = host();
    let uuid = create(&host, dir.path(), "survival", false).await;

    assert_eq!(start(&host, uuid, false).await, ProcedureCallResultInner::Void);
    assert_ne!(host.state(uuid).await.unwrap(), State::Running);
    wait_for_state(&host, uuid, State::Running).await;
}

#[tokio::test]
async fn kill_is_terminal_and_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let host = host();
    let uuid = create(&host, dir.path(), "survival", false).await;
    start(&host, uuid, true).await;

    let kill = ProcedureCallInner::KillInstance {
        instance_uuid: uuid,
        caused_by: steve(),
    };
    assert_eq!(
        call(&host, kill.clone()).await.unwrap(),
        ProcedureCallResultInner::State(State::Stopped)
    );
    assert_eq!(
        call(&host, ProcedureCallInner::GetState { instance_uuid: uuid })
            .await
            .unwrap(),
        ProcedureCallResultInner::State(State::Stopped)
    );
    assert_eq!(
        call(&host, kill).await.unwrap(),
        ProcedureCallResultInner::State(State::Stopped)
    );
}

#[tokio::test]
async fn restart_without_native_support_stops_then_starts() {
    let dir = tempfile::tempdir().unwrap();
    let host = host();
    let uuid = create(&host, dir.path(), "survival", false).await;
    start(&host, uuid, true).await;

    let reply = call(
        &host,
        ProcedureCallInner::RestartInstance {
            instance_uuid: uuid,
            caused_by: steve(),
            block: true,
        },
    )
    .await
    .unwrap();
    assert_eq!(reply, ProcedureCallResultInner::State(State::Running));
}

#[tokio::test]
async fn crash_restarts_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let host = host();
    let uuid = create(&host, dir.path(), "hardcore", true).await;
    start(&host, uuid, true).await;

    call(
        &host,
        ProcedureCallInner::SendCommand {
            instance_uuid: uuid,
            command: "crash".to_string(),
            caused_by: steve(),
        },
    )
    .await
    .unwrap();

    let errored = || {
        host.events().buffered(None).iter().any(|e| {
            matches!(
                &e.event_inner,
                EventInner::InstanceEvent(i) if matches!(
                    i.instance_event_inner,
                    InstanceEventInner::StateTransition { to: State::Error, .. }
                )
            )
        })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while !errored() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("crash was not reported");
    wait_for_state(&host, uuid, State::Running).await;
}

#[tokio::test]
async fn players_come_and_go() {
    let dir = tempfile::tempdir().unwrap();
    let host = host();
    let uuid = create(&host, dir.path(), "survival", false).await;
    start(&host, uuid, true).await;

    for command in ["join alex", "join steve", "leave alex"] {
        call(
            &host,
            ProcedureCallInner::SendCommand {
                instance_uuid: uuid,
                command: command.to_string(),
                caused_by: steve(),
            },
        )
        .await
        .unwrap();
    }

    let reply = call(&host, ProcedureCallInner::GetPlayerList { instance_uuid: uuid })
        .await
        .unwrap();
    let ProcedureCallResultInner::Player(players) = reply else {
        panic!("unexpected reply {reply:?}");
    };
    let names: Vec<_> = players.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["steve"]);

    let changes = host
        .events()
        .buffered(None)
        .iter()
        .filter(|e| {
            matches!(
                &e.event_inner,
                EventInner::InstanceEvent(i)
                    if matches!(i.instance_event_inner, InstanceEventInner::PlayerChange { .. })
            )
        })
        .count();
    assert_eq!(changes, 3);
}

#[tokio::test]
async fn macro_moves_from_tasks_to_history() {
    let dir = tempfile::tempdir().unwrap();
    let host = host();
    let uuid = create(&host, dir.path(), "survival", false).await;
    start(&host, uuid, true).await;
    let mut rx = host.events().subscribe();

    call(
        &host,
        ProcedureCallInner::CreateMacro {
            instance_uuid: uuid,
            name: "deploy".to_string(),
            content: "say deploying $1\nwait 200ms\nsay done".to_string(),
        },
    )
    .await
    .unwrap();
    let pid = call(
        &host,
        ProcedureCallInner::RunMacro {
            instance_uuid: uuid,
            name: "deploy".to_string(),
            args: vec!["--fast".to_string()],
            caused_by: steve(),
        },
    )
    .await
    .unwrap()
    .into_num()
    .unwrap();

    let tasks = call(&host, ProcedureCallInner::GetTaskList { instance_uuid: uuid })
        .await
        .unwrap();
    let ProcedureCallResultInner::TaskList(tasks) = tasks else {
        panic!("unexpected reply {tasks:?}");
    };
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].pid.0, pid);
    assert_eq!(tasks[0].args, vec!["--fast"]);
    let event_id = tasks[0].event_id.clone();

    let history = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let reply = call(&host, ProcedureCallInner::GetHistoryList { instance_uuid: uuid })
                .await
                .unwrap();
            if let ProcedureCallResultInner::HistoryList(history) = reply {
                if !history.is_empty() {
                    return history;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(history[0].success());
    assert!(matches!(history[0].exit_status, ExitStatus::Success { .. }));
    let tasks = call(&host, ProcedureCallInner::GetTaskList { instance_uuid: uuid })
        .await
        .unwrap();
    assert_eq!(tasks, ProcedureCallResultInner::TaskList(Vec::new()));

    // The macro's progression folds into one finished notification.
    let mut center = NotificationCenter::new();
    center.try_drain(&mut rx);
    let item = center.get(&event_id).expect("macro progression missing");
    assert_eq!(item.state, NotificationState::Done);
    assert_eq!(item.total, Some(3.0));
    assert_eq!(item.progress, 3.0);
}

#[tokio::test]
async fn duplicate_events_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let host = host();
    create(&host, dir.path(), "survival", false).await;

    let mut center = NotificationCenter::new();
    let events = host.events().buffered(None);
    for event in &events {
        center.ingest(event.clone());
    }
    let len = center.events().len();
    assert_eq!(center.ingest(events[0].clone()), Ingest::Duplicate);
    assert_eq!(center.events().len(), len);
}

#[tokio::test]
async fn restore_all_brings_instances_back() {
    let dir = tempfile::tempdir().unwrap();
    let uuid = {
        let host = host();
        let uuid = create(&host, dir.path(), "survival", false).await;
        call(
            &host,
            ProcedureCallInner::SetName {
                instance_uuid: uuid,
                new_name: "renamed".to_string(),
            },
        )
        .await
        .unwrap();
        host.shutdown().await;
        uuid
    };

    let host = host();
    assert_eq!(host.restore_all(dir.path()).await, vec![uuid]);
    assert_eq!(
        call(&host, ProcedureCallInner::GetName { instance_uuid: uuid })
            .await
            .unwrap(),
        ProcedureCallResultInner::String("renamed".to_string())
    );
    // Created with auto start enabled.
    wait_for_state(&host, uuid, State::Running).await;
}
