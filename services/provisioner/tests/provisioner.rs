//! Integration tests for the provisioner facade.
//!
//! Everything runs over the in-repo fakes: a scriptable host client, an
//! asserting router and a recording binding sink.

use std::sync::Arc;

use slipway_provisioner::config::Config;
use slipway_provisioner::container::{AppRef, Status};
use slipway_provisioner::engine::{self, ChangeUnitsArgs};
use slipway_provisioner::provisioner::{DeployOptions, ProvisionError, ShellOptions};
use slipway_provisioner::state::NullProgress;
use slipway_provisioner::testing::{to_add, BufferProgress, TestEnv};

const NODE0: &str = "http://node0:2375";
const NODE1: &str = "http://node1:2375";
const PLATFORM_IMAGE: &str = "slipway/python:latest";

fn app(name: &str) -> AppRef {
    AppRef::new(name, "python").with_pool("pool1")
}

fn deploy_opts(app: &AppRef) -> DeployOptions {
    DeployOptions {
        app: app.clone(),
        version: Some("master".to_string()),
        commit: Some("123".to_string()),
        image: None,
        writer: Arc::new(NullProgress),
    }
}

async fn env_with_node() -> TestEnv {
    let env = TestEnv::new();
    env.register_node(NODE0, "pool1").await;
    env.host.seed_node_image(NODE0, PLATFORM_IMAGE);
    env
}

#[tokio::test]
async fn test_provision_creates_router_backend() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    p.provision(&app("myapp")).await.unwrap();
    assert!(env.router.has_backend("myapp"));
}

#[tokio::test]
async fn test_first_deploy() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("otherapp");
    p.provision(&a).await.unwrap();

    let tag = p.deploy(deploy_opts(&a)).await.unwrap();
    assert_eq!(tag, "slipway/app-otherapp:v1");

    let units = p.units(&a).unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].status, Status::Starting);
    assert!(!units[0].ip.is_empty());
    assert!(units[0].address.starts_with("http://node0:"));

    // Exactly one route, pointing at the new unit, and the unit is bound.
    assert_eq!(env.router.route_count("otherapp"), 1);
    assert!(env.router.has_route("otherapp", &units[0].address));
    assert!(env.binding.has_bind(&units[0].name));

    // The image landed on the node and in the catalog.
    assert!(env.host.has_image(NODE0, "slipway/app-otherapp:v1"));
    assert_eq!(
        env.storage.images().current_tag("otherapp").unwrap(),
        "slipway/app-otherapp:v1"
    );
}

#[tokio::test]
async fn test_deploy_erases_old_images() {
    let env = TestEnv::with_config(Config {
        image_history_size: 1,
        ..Config::default()
    });
    env.register_node(NODE0, "pool1").await;
    env.host.seed_node_image(NODE0, PLATFORM_IMAGE);
    let p = env.provisioner("web: python myapp.py");
    let a = app("otherapp");
    p.provision(&a).await.unwrap();

    p.deploy(deploy_opts(&a)).await.unwrap();
    assert_eq!(
        env.host.all_images(),
        vec!["slipway/app-otherapp:v1", PLATFORM_IMAGE]
    );

    p.deploy(deploy_opts(&a)).await.unwrap();
    assert_eq!(
        env.host.all_images(),
        vec!["slipway/app-otherapp:v2", PLATFORM_IMAGE]
    );
    assert_eq!(
        env.storage.images().list_tags("otherapp").unwrap(),
        vec!["slipway/app-otherapp:v2"]
    );
}

#[tokio::test]
async fn test_deploy_erases_old_images_with_long_history() {
    let env = TestEnv::with_config(Config {
        image_history_size: 2,
        ..Config::default()
    });
    env.register_node(NODE0, "pool1").await;
    env.host.seed_node_image(NODE0, PLATFORM_IMAGE);
    let p = env.provisioner("web: python myapp.py");
    let a = app("otherapp");
    p.provision(&a).await.unwrap();

    p.deploy(deploy_opts(&a)).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    assert_eq!(
        env.host.all_images(),
        vec![
            "slipway/app-otherapp:v1",
            "slipway/app-otherapp:v2",
            PLATFORM_IMAGE
        ]
    );

    p.deploy(deploy_opts(&a)).await.unwrap();
    assert_eq!(
        env.host.all_images(),
        vec![
            "slipway/app-otherapp:v2",
            "slipway/app-otherapp:v3",
            PLATFORM_IMAGE
        ]
    );
}

#[tokio::test]
async fn test_failed_deploy_keeps_previous_image() {
    let env = TestEnv::with_config(Config {
        image_history_size: 1,
        ..Config::default()
    });
    env.register_node(NODE0, "pool1").await;
    env.host.seed_node_image(NODE0, PLATFORM_IMAGE);
    let p = env.provisioner("web: python myapp.py");
    let a = app("otherapp");
    p.provision(&a).await.unwrap();

    p.deploy(deploy_opts(&a)).await.unwrap();
    let units_before = p.units(&a).unwrap();

    // Second deploy fails creating its container.
    env.host.fail_create_on_call(2);
    let err = p.deploy(deploy_opts(&a)).await.unwrap_err();
    assert!(err.to_string().contains("cannot create container"));

    // The current image is unchanged and still present everywhere.
    assert_eq!(
        env.storage.images().current_tag("otherapp").unwrap(),
        "slipway/app-otherapp:v1"
    );
    assert!(env.host.has_image(NODE0, "slipway/app-otherapp:v1"));

    // The old unit still runs and is still routed.
    let units = p.units(&a).unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].name, units_before[0].name);
    assert!(env.router.has_route("otherapp", &units[0].address));
}

#[tokio::test]
async fn test_image_deploy() {
    let env = env_with_node().await;
    env.seed_image("otherapp", "slipway/app-otherapp:v1", "web: python myapp.py");
    let p = env.provisioner("web: python myapp.py");
    let a = app("otherapp");
    p.provision(&a).await.unwrap();

    let tag = p
        .deploy(DeployOptions {
            app: a.clone(),
            version: None,
            commit: None,
            image: Some("slipway/app-otherapp:v1".to_string()),
            writer: Arc::new(NullProgress),
        })
        .await
        .unwrap();
    assert_eq!(tag, "slipway/app-otherapp:v1");
    assert_eq!(p.units(&a).unwrap().len(), 1);
}

#[tokio::test]
async fn test_image_deploy_invalid_image() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("otherapp");
    p.provision(&a).await.unwrap();

    let err = p
        .deploy(DeployOptions {
            app: a.clone(),
            version: None,
            commit: None,
            image: Some("slipway/app-otherapp:v1".to_string()),
            writer: Arc::new(NullProgress),
        })
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "invalid image for app otherapp: slipway/app-otherapp:v1"
    );
    assert!(p.units(&a).unwrap().is_empty());
}

#[tokio::test]
async fn test_rolling_restart_replaces_all_processes() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python web.py\nworker: python worker.py");
    let a = app("almah");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();

    let before = p.units(&a).unwrap();
    assert_eq!(before.len(), 2);
    let old_names: Vec<String> = before.iter().map(|u| u.name.clone()).collect();
    let old_addresses: Vec<String> = before.iter().map(|u| u.address.clone()).collect();

    p.restart(&a, "", Arc::new(NullProgress)).await.unwrap();

    let after = p.units(&a).unwrap();
    assert_eq!(after.len(), 2);
    for unit in &after {
        assert!(!old_names.contains(&unit.name));
        assert_eq!(unit.status, Status::Starting);
        assert!(env.router.has_route("almah", &unit.address));
    }
    for address in &old_addresses {
        assert!(!env.router.has_route("almah", address));
    }
}

#[tokio::test]
async fn test_restart_single_process_keeps_the_other() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python web.py\nworker: python worker.py");
    let a = app("almah");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();

    let before = p.units(&a).unwrap();
    let worker_before = before
        .iter()
        .find(|u| {
            let c = env.storage.containers().get(&u.name).unwrap();
            c.process_name == "worker"
        })
        .unwrap()
        .clone();

    p.restart(&a, "web", Arc::new(NullProgress)).await.unwrap();

    let after = p.units(&a).unwrap();
    assert_eq!(after.len(), 2);
    assert!(after.iter().any(|u| u.name == worker_before.name));
    let new_web = after
        .iter()
        .find(|u| u.name != worker_before.name)
        .unwrap();
    assert!(!before.iter().any(|u| u.name == new_web.name));
    assert_eq!(new_web.status, Status::Starting);
}

#[tokio::test]
async fn test_add_units() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let a = a.with_deploys(1);

    let units = p
        .add_units(&a, 3, "web", Arc::new(NullProgress))
        .await
        .unwrap();
    assert_eq!(units.len(), 3);
    assert_eq!(p.units(&a).unwrap().len(), 4);
    assert_eq!(env.router.route_count("myapp"), 4);
}

#[tokio::test]
async fn test_add_units_validations() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp").with_deploys(1);
    env.seed_image("myapp", "slipway/app-myapp:v1", "web: python myapp.py");

    let err = p
        .add_units(&a, 0, "web", Arc::new(NullProgress))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Cannot add 0 units");

    let err = p
        .add_units(&a, 3, "bogus", Arc::new(NullProgress))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "process error: no command declared in Procfile for process \"bogus\""
    );

    let fresh = app("freshapp");
    let err = p
        .add_units(&fresh, 1, "web", Arc::new(NullProgress))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "New units can only be added after the first deployment"
    );
}

#[tokio::test]
async fn test_add_units_failure_leaves_no_lost_units() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let a = a.with_deploys(1);

    // The second new container fails to start; everything added by the
    // operation must be rolled back.
    env.host.fail_start_on_call(3);
    let err = p
        .add_units(&a, 3, "web", Arc::new(NullProgress))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("cannot start container"));

    assert_eq!(p.units(&a).unwrap().len(), 1);
    assert_eq!(env.host.container_count(), 1);
    assert_eq!(env.router.route_count("myapp"), 1);
}

#[tokio::test]
async fn test_remove_units() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("impius");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let a = a.with_deploys(1);
    p.add_units(&a, 2, "web", Arc::new(NullProgress))
        .await
        .unwrap();
    assert_eq!(p.units(&a).unwrap().len(), 3);

    p.remove_units(&a, 2, "web", Arc::new(NullProgress))
        .await
        .unwrap();

    let units = p.units(&a).unwrap();
    assert_eq!(units.len(), 1);
    assert_eq!(env.router.route_count("impius"), 1);
    assert!(env.router.has_route("impius", &units[0].address));
    assert_eq!(env.binding.bound_count(), 1);
}

#[tokio::test]
async fn test_remove_units_failed_route_removal_preserves_everything() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("impius");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let a = a.with_deploys(1);
    p.add_units(&a, 2, "web", Arc::new(NullProgress))
        .await
        .unwrap();

    let units = p.units(&a).unwrap();
    assert_eq!(units.len(), 3);
    // Fail removing the route of the second victim, after the first one
    // already lost its route.
    env.router.fail_for_address(&units[1].address);

    let err = p
        .remove_units(&a, 2, "web", Arc::new(NullProgress))
        .await
        .unwrap_err();
    assert!(err
        .to_string()
        .starts_with("error removing routes, units weren't removed"));

    // Nothing was removed: all containers, routes and binds survive.
    assert_eq!(p.units(&a).unwrap().len(), 3);
    assert_eq!(env.router.route_count("impius"), 3);
    for unit in &units {
        assert!(env.router.has_route("impius", &unit.address));
        assert!(env.binding.has_bind(&unit.name));
    }
}

#[tokio::test]
async fn test_remove_units_validations() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("impius");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let a = a.with_deploys(1);

    let err = p
        .remove_units(&a, 0, "web", Arc::new(NullProgress))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "cannot remove zero units");

    let err = p
        .remove_units(&a, 4, "web", Arc::new(NullProgress))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "cannot remove 4 units from process \"web\", only 1 available"
    );

    let err = p
        .remove_units(&a, 1, "worker", Arc::new(NullProgress))
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "process error: no command declared in Procfile for process \"worker\""
    );
}

#[tokio::test]
async fn test_start_and_stop() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();

    p.stop(&a, "").await.unwrap();
    let units = p.units(&a).unwrap();
    assert_eq!(units[0].status, Status::Stopped);

    // Stopping again skips the already stopped container.
    p.stop(&a, "").await.unwrap();

    p.start(&a, "").await.unwrap();
    let units = p.units(&a).unwrap();
    assert_eq!(units[0].status, Status::Starting);
}

#[tokio::test]
async fn test_set_unit_status() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("someapp");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let unit = p.units(&a).unwrap().remove(0);

    p.set_unit_status(&unit.name, "someapp", Status::Error)
        .await
        .unwrap();
    let container = env.storage.containers().get(&unit.name).unwrap();
    assert_eq!(container.status, Status::Error);

    // Without an app name the id alone is accepted.
    p.set_unit_status(&unit.name, "", Status::Stopped)
        .await
        .unwrap();

    let err = p
        .set_unit_status(&unit.name, "someappa", Status::Error)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "wrong app name");

    let err = p
        .set_unit_status("mycontainer", "myapp", Status::Error)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::UnitNotFound));
}

#[tokio::test]
async fn test_set_unit_status_started_refreshes_ip() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myawesomeapp");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let unit = p.units(&a).unwrap().remove(0);

    // Corrupt the stored ip, then report Started: inspection wins.
    env.storage
        .containers()
        .set_network(&unit.name, "xinvalidx", "9025")
        .unwrap();
    env.host.set_inspect(
        &unit.name,
        slipway_provisioner::cluster::host::ContainerInspect {
            id: unit.name.clone(),
            running: true,
            ip: "172.17.0.9".to_string(),
            host_port: "49900".to_string(),
        },
    );

    p.set_unit_status(&unit.name, "myawesomeapp", Status::Started)
        .await
        .unwrap();
    let container = env.storage.containers().get(&unit.name).unwrap();
    assert_eq!(container.status, Status::Started);
    assert_eq!(container.ip, "172.17.0.9");
    assert_eq!(container.host_port, "49900");
}

#[tokio::test]
async fn test_register_unit_promotes_to_started() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let unit = p.units(&a).unwrap().remove(0);

    p.register_unit(&unit.name, serde_json::json!({}))
        .await
        .unwrap();
    let container = env.storage.containers().get(&unit.name).unwrap();
    assert_eq!(container.status, Status::Started);
}

#[tokio::test]
async fn test_register_unit_building_saves_custom_data() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let unit = p.units(&a).unwrap().remove(0);

    // Put the container back into Building, as it is mid-deploy.
    env.storage
        .containers()
        .set_status(&unit.name, Status::Building)
        .unwrap();

    let payload = serde_json::json!({
        "procfile": "web: python app.py\nworker: python worker.py",
    });
    p.register_unit(&unit.name, payload).await.unwrap();

    // Status stays Building; the payload landed on the build image.
    let container = env.storage.containers().get(&unit.name).unwrap();
    assert_eq!(container.status, Status::Building);
    let data = env
        .storage
        .images()
        .load_custom_data(container.build_image.as_deref().unwrap())
        .unwrap();
    assert_eq!(
        data.process_table().command("worker"),
        Ok("python worker.py")
    );
}

#[tokio::test]
async fn test_destroy_removes_everything() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("mydoomedapp");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let unit = p.units(&a).unwrap().remove(0);
    assert!(env.binding.has_bind(&unit.name));

    p.destroy(&a).await.unwrap();

    assert!(p.units(&a).unwrap().is_empty());
    assert!(!env.router.has_backend("mydoomedapp"));
    assert!(!env.binding.has_bind(&unit.name));
    assert_eq!(env.host.container_count(), 0);
    // Only the platform base remains on the node.
    assert_eq!(env.host.all_images(), vec![PLATFORM_IMAGE]);
    assert!(env
        .storage
        .images()
        .list_tags("mydoomedapp")
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_destroy_app_without_units() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp");
    p.provision(&a).await.unwrap();
    p.destroy(&a).await.unwrap();
    assert!(!env.router.has_backend("myapp"));
}

#[tokio::test]
async fn test_addr_comes_from_router() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp");
    p.provision(&a).await.unwrap();
    assert_eq!(p.addr(&a).await.unwrap(), "myapp.fakerouter.io");
}

#[tokio::test]
async fn test_execute_command_runs_on_all_units() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("starbreaker");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let a = a.with_deploys(1);
    p.add_units(&a, 1, "web", Arc::new(NullProgress))
        .await
        .unwrap();

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let cmd = vec!["ls".to_string(), "-l".to_string()];
    p.execute_command(&mut stdout, &mut stderr, &a, &cmd)
        .await
        .unwrap();
    assert_eq!(env.host.exec_log().len(), 2);
    assert!(String::from_utf8_lossy(&stdout).contains("ls -l"));

    p.execute_command_once(&mut stdout, &mut stderr, &a, &cmd)
        .await
        .unwrap();
    assert_eq!(env.host.exec_log().len(), 3);
}

#[tokio::test]
async fn test_execute_command_without_units() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("ghostapp");
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let err = p
        .execute_command(&mut stdout, &mut stderr, &a, &["date".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "app must have at least 1 unit");
}

#[tokio::test]
async fn test_shell_attaches_to_named_unit() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let unit = p.units(&a).unwrap().remove(0);

    let (mut client, server) = tokio::io::duplex(1024);
    let opts = ShellOptions {
        app: "myapp".to_string(),
        unit: Some(unit.name.clone()),
        width: 140,
        height: 38,
        term: "xterm-256color".to_string(),
    };
    let mut server = server;
    p.shell(&opts, &mut server).await.unwrap();
    drop(server);

    use tokio::io::AsyncReadExt;
    let mut banner = String::new();
    client.read_to_string(&mut banner).await.unwrap();
    assert!(banner.contains(&unit.name));
}

#[tokio::test]
async fn test_shell_unknown_unit() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let opts = ShellOptions {
        app: "myapp".to_string(),
        unit: Some("nope".to_string()),
        width: 80,
        height: 24,
        term: "xterm".to_string(),
    };
    let (_client, mut server) = tokio::io::duplex(64);
    let err = p.shell(&opts, &mut server).await.unwrap_err();
    assert!(matches!(err, ProvisionError::UnitNotFound));
}

#[tokio::test]
async fn test_closed_writer_cancels_before_side_effects() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp");
    p.provision(&a).await.unwrap();

    let writer = Arc::new(BufferProgress::new());
    writer.close();
    let err = p
        .deploy(DeployOptions {
            app: a.clone(),
            version: Some("master".to_string()),
            commit: None,
            image: None,
            writer: writer.clone(),
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("canceled by client"));
    assert!(p.units(&a).unwrap().is_empty());
    assert_eq!(env.host.container_count(), 0);
}

#[tokio::test]
async fn test_swap_and_swap_back() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let blue = app("blue");
    let green = app("green");
    p.provision(&blue).await.unwrap();
    p.provision(&green).await.unwrap();
    p.deploy(deploy_opts(&blue)).await.unwrap();
    p.deploy(deploy_opts(&green)).await.unwrap();

    let blue_route = p.units(&blue).unwrap()[0].address.clone();
    let green_route = p.units(&green).unwrap()[0].address.clone();

    p.swap(&blue, &green).await.unwrap();
    assert!(env.router.has_route("blue", &green_route));
    assert!(env.router.has_route("green", &blue_route));

    // A swapped backend refuses destruction until swapped back.
    let err = p.destroy(&blue).await.unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::Router(slipway_provisioner::router::RouterError::BackendSwapped)
    ));

    p.swap(&blue, &green).await.unwrap();
    assert!(env.router.has_route("blue", &blue_route));
    p.destroy(&blue).await.unwrap();
}

#[tokio::test]
async fn test_cname_management() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp");
    p.provision(&a).await.unwrap();

    p.set_cname("shop.example.org", &a).await.unwrap();
    assert!(env.router.has_cname("myapp", "shop.example.org"));

    let err = p.set_cname("myapp.fakerouter.io", &a).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "cname is not allowed in the router managed domain"
    );

    p.unset_cname("shop.example.org", &a).await.unwrap();
    assert!(!env.router.has_cname("myapp", "shop.example.org"));
}

#[tokio::test]
async fn test_add_containers_honors_target_host() {
    let env = env_with_node().await;
    env.register_node(NODE1, "pool1").await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();

    let args = ChangeUnitsArgs {
        app: a.clone(),
        to_add: to_add(&[("web", 2)]),
        to_remove: Vec::new(),
        image: "slipway/app-myapp:v1".to_string(),
        build_image: None,
        to_host: Some(NODE1.to_string()),
        avoid_hosts: Vec::new(),
        writer: Arc::new(NullProgress),
    };
    let created = engine::add_containers(p.state(), args).await.unwrap();
    assert_eq!(created.len(), 2);
    for container in &created {
        assert_eq!(container.host_addr, "node1");
    }
}

#[tokio::test]
async fn test_scheduling_spreads_across_pool_nodes() {
    let env = env_with_node().await;
    env.register_node(NODE1, "pool1").await;
    env.host.seed_node_image(NODE1, PLATFORM_IMAGE);
    let p = env.provisioner("web: python myapp.py");
    let a = app("myapp");
    p.provision(&a).await.unwrap();
    p.deploy(deploy_opts(&a)).await.unwrap();
    let a = a.with_deploys(1);
    p.add_units(&a, 3, "web", Arc::new(NullProgress))
        .await
        .unwrap();

    let containers = env
        .storage
        .containers()
        .list_by_app("myapp", None, None)
        .unwrap();
    let on_node0 = containers.iter().filter(|c| c.host_addr == "node0").count();
    let on_node1 = containers.iter().filter(|c| c.host_addr == "node1").count();
    assert_eq!(on_node0, 2);
    assert_eq!(on_node1, 2);
}

#[tokio::test]
async fn test_deploy_streams_progress() {
    let env = env_with_node().await;
    let p = env.provisioner("web: python myapp.py");
    let a = app("otherapp");
    p.provision(&a).await.unwrap();
    let writer = Arc::new(BufferProgress::new());
    p.deploy(DeployOptions {
        app: a.clone(),
        version: Some("master".to_string()),
        commit: Some("123".to_string()),
        image: None,
        writer: writer.clone(),
    })
    .await
    .unwrap();
    let output = writer.contents();
    assert!(output.contains("Building image slipway/app-otherapp:v1"));
    assert!(output.contains("Started unit"));
}
