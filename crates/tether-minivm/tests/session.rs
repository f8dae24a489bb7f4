//! Variable persistence across runs of a stateful session.

use anyhow::Result;
use serde_json::json;
use tether::{ExecOptions, StatefulSession};
use tether_minivm::MiniVm;
use tether_native::NativeBindings;

fn session() -> StatefulSession<NativeBindings<MiniVm>> {
    StatefulSession::new(NativeBindings::new())
}

#[tokio::test]
async fn variables_survive_across_runs() -> Result<()> {
    let mut session = session();
    session.run("x = 10", &ExecOptions::default()).await?;
    assert_eq!(session.state().get("x"), Some(&json!(10)));

    let done = session.run("y = x + 5", &ExecOptions::default()).await?;
    assert_eq!(session.state().get("y"), Some(&json!(15)));
    // The wrapped script's final expression is the persisted map.
    assert_eq!(done.value, json!({"x": 10, "y": 15}));
    Ok(())
}

#[tokio::test]
async fn failing_run_leaves_state_untouched() -> Result<()> {
    let mut session = session();
    session.run("x = 1", &ExecOptions::default()).await?;

    let err = session
        .run("x = 99\n1 / 0", &ExecOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.script().expect("script error").exc_type, "ZeroDivisionError");
    assert_eq!(session.state().get("x"), Some(&json!(1)));
    Ok(())
}

#[tokio::test]
async fn underscore_variables_are_not_persisted() -> Result<()> {
    let mut session = session();
    session
        .run("x = 1\n_scratch = 2", &ExecOptions::default())
        .await?;
    assert_eq!(session.state().get("x"), Some(&json!(1)));
    assert!(session.state().get("_scratch").is_none());
    Ok(())
}

#[tokio::test]
async fn externals_are_answered_by_the_handler() -> Result<()> {
    let mut session = session();
    let opts = ExecOptions::default().external_function("fetch");
    let done = session
        .run_with("r = fetch('https://a')", &opts, |call| async move {
            assert_eq!(call.function, "fetch");
            assert_eq!(call.args, vec![json!("https://a")]);
            Ok(json!("body"))
        })
        .await?;
    assert_eq!(done.value, json!({"r": "body"}));
    assert_eq!(session.state().get("r"), Some(&json!("body")));
    Ok(())
}

#[tokio::test]
async fn unhandled_external_raises_inside_the_script() -> Result<()> {
    let mut session = session();
    let opts = ExecOptions::default().external_function("fetch");
    let err = session.run("r = fetch('u')", &opts).await.unwrap_err();
    let script = err.script().expect("script error");
    assert!(script.message.contains("no handler for external function"));
    // The failed run staged nothing.
    assert!(session.state().is_empty());
    Ok(())
}

#[tokio::test]
async fn seeded_state_is_visible_to_the_first_run() -> Result<()> {
    let mut seed = serde_json::Map::new();
    seed.insert("base".to_string(), json!(40));
    let mut session = StatefulSession::new(NativeBindings::<MiniVm>::new()).with_state(seed);

    let done = session.run("total = base + 2", &ExecOptions::default()).await?;
    assert_eq!(done.value, json!({"base": 40, "total": 42}));
    Ok(())
}
