//! Proxy operations against a scripted remote runtime.

mod common;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::Duration;

use futures::TryStreamExt;
use rand::seq::SliceRandom;
use serde_json::json;

use exobridge::CallOptions;
use exobridge::Error;
use exobridge::InspectMode;
use exobridge::LocalRef;
use exobridge::RemoteHandle;
use exobridge::Value;

use common::answer_get;
use common::expect;
use common::r;

// --- Test 1: Primitive reads ---

#[tokio::test]
async fn test_get_primitive() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move { global.get("answer").await });
    let request = remote.recv().await.expect("No request");
    assert_eq!(request, json!({ "r": 1, "action": "get", "ffid": 0, "key": "answer" }));
    remote.reply(1, "num", json!(42)).await.unwrap();

    let value = task.await.unwrap().expect("Get failed");
    assert_eq!(value.as_i64(), Some(42));
}

// --- Test 2: Fresh correlation ids ---

#[tokio::test]
async fn test_every_operation_uses_a_fresh_id() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move {
        global.get("a").await?;
        global.set("b", 2i64).await?;
        global.index(3).await?;
        global.set_index(4, "four").await
    });

    let mut seen = Vec::new();
    for action in ["get", "set", "get", "set"] {
        let request = expect(&remote, action).await;
        let id = r(&request);
        if action == "set" {
            assert_eq!(request["p"], json!(0));
            assert_eq!(request["args"].as_array().map(Vec::len), Some(1));
        }
        remote.reply(id, "void", json!(null)).await.unwrap();
        seen.push(id);
    }
    task.await.unwrap().expect("Operations failed");

    // sets reserve a second id for the assignment reply
    assert_eq!(seen, vec![1, 2, 4, 5]);
}

// --- Test 3: Methods keep their receiver ---

#[tokio::test]
async fn test_fn_result_calls_original_context() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move {
        let greet = global.get("greet").await?.into_proxy()?;
        assert_eq!(greet.target_ffid(), 0);
        greet.call(vec![Value::from("exo")]).await
    });

    answer_get(&remote, "greet", "fn", json!(7)).await;
    let call = expect(&remote, "call").await;
    assert_eq!(call["ffid"], json!(0));
    assert_eq!(call["key"], json!("greet"));
    assert_eq!(call["args"], json!(["exo"]));
    assert_eq!(call["p"], json!(0));
    remote.reply(r(&call), "string", json!("hello exo")).await.unwrap();

    let value = task.await.unwrap().expect("Call failed");
    assert_eq!(value.as_str(), Some("hello exo"));
}

#[tokio::test]
async fn test_fn_returned_by_call_is_unbound() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move {
        let factory = global.get("factory").await?.into_proxy()?;
        let made = factory.call(vec![]).await?.into_proxy()?;
        made.call(vec![]).await
    });

    answer_get(&remote, "factory", "fn", json!(8)).await;
    let first = expect(&remote, "call").await;
    remote.reply(r(&first), "fn", json!(9)).await.unwrap();

    let second = expect(&remote, "call").await;
    assert_eq!(second["ffid"], json!(9));
    assert_eq!(second["key"], json!(""));
    remote.reply(r(&second), "void", json!(null)).await.unwrap();

    assert!(task.await.unwrap().expect("Call failed").is_void());
}

// --- Test 4: Kind decoding ---

#[tokio::test]
async fn test_void_and_value_kinds() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move {
        let nothing = global.get("nothing").await?;
        let list = global.get("list").await?;
        Ok::<_, Error>((nothing, list))
    });

    answer_get(&remote, "nothing", "void", json!(null)).await;
    answer_get(&remote, "list", "array", json!([1, { "ffid": 3 }])).await;

    let (nothing, list) = task.await.unwrap().expect("Gets failed");
    assert!(nothing.is_void());
    // plain values pass through untouched
    assert_eq!(list.as_json(), Some(&json!([1, { "ffid": 3 }])));
}

#[tokio::test]
async fn test_reference_kind_with_bad_payload_is_protocol_violation() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move { global.get("broken").await });
    answer_get(&remote, "broken", "obj", json!("not an ffid")).await;

    assert!(matches!(task.await.unwrap(), Err(Error::ProtocolViolation(_))));
}

// --- Test 5: Adoption round trip ---

#[tokio::test]
async fn test_adoption_round_trip() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let times_ten = LocalRef::function("times_ten", |args: Vec<Value>| async move {
        let n = args.first().and_then(Value::as_i64).unwrap_or_default();
        Ok(Value::from(n * 10))
    });

    let passed = times_ten.clone();
    let task = tokio::spawn(async move {
        let register = global.get("register").await?.into_proxy()?;
        register.call(vec![Value::Local(passed)]).await
    });

    answer_get(&remote, "register", "fn", json!(5)).await;
    let call = expect(&remote, "call").await;
    assert_eq!(call["args"], json!([{ "r": 1, "ffid": "" }]));
    assert_eq!(call["p"], json!(1));

    remote.assign(r(&call), &[(1, 50)]).await.unwrap();
    remote.reply(r(&call), "py", json!(50)).await.unwrap();

    let returned = task.await.unwrap().expect("Call failed");
    let returned = returned.as_local().expect("Expected a local object back");
    assert!(returned.ptr_eq(&times_ten));
    assert!(bridge.resolve(50).unwrap().ptr_eq(&times_ten));
    assert_eq!(times_ten.ffid(), Some(50));

    // the remote side calls back into the adopted function
    remote.send(json!({ "r": 900, "action": "call", "ffid": 50, "args": [4] })).await.unwrap();
    let response = remote.recv().await.expect("No response to invocation");
    assert_eq!(response, json!({ "r": 900, "key": "val", "val": 40 }));
}

#[tokio::test]
async fn test_callback_during_call_finds_adopted_object() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let listener = LocalRef::function("listener", move |args: Vec<Value>| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send(args.first().and_then(Value::as_str).map(str::to_owned));
            Ok(Value::Void)
        }
    });

    let task = tokio::spawn(async move {
        let run = global.get("runWith").await?.into_proxy()?;
        run.call(vec![Value::Local(listener)]).await
    });

    answer_get(&remote, "runWith", "fn", json!(6)).await;
    let call = expect(&remote, "call").await;
    remote.assign(r(&call), &[(1, 61)]).await.unwrap();
    // reentrant callback before the call result
    remote.send(json!({ "r": 901, "action": "call", "ffid": 61, "args": ["ping"] })).await.unwrap();

    let response = remote.recv().await.expect("No response to invocation");
    assert_eq!(response, json!({ "r": 901, "key": "void", "val": null }));
    assert_eq!(seen_rx.recv().await.flatten().as_deref(), Some("ping"));

    remote.reply(r(&call), "void", json!(null)).await.unwrap();
    task.await.unwrap().expect("Call failed");
}

#[tokio::test]
async fn test_result_before_assignment_does_not_stall_the_loop() {
    let (bridge, remote) = common::start();
    let global = bridge.global();
    let handler = LocalRef::function("handler", |_| async { Ok(Value::Void) });

    let passed = handler.clone();
    let calling = global.clone();
    let task = tokio::spawn(async move {
        let f = calling.get("f").await?.into_proxy()?;
        let options = CallOptions::default().with_timeout(Duration::from_secs(5));
        f.call_with(vec![Value::Local(passed)], options).await
    });

    answer_get(&remote, "f", "fn", json!(7)).await;
    let call = expect(&remote, "call").await;
    remote.reply(r(&call), "num", json!(1)).await.unwrap();
    remote.assign(r(&call), &[(1, 70)]).await.unwrap();

    // other callers keep getting their replies
    let unrelated = tokio::spawn(async move { global.get("x").await });
    answer_get(&remote, "x", "num", json!(7)).await;
    let x = tokio::time::timeout(Duration::from_secs(1), unrelated)
        .await
        .expect("Loop stalled")
        .unwrap()
        .unwrap();
    assert_eq!(x.as_i64(), Some(7));

    let result = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("Call stalled")
        .unwrap()
        .expect("Call failed");
    assert_eq!(result.as_i64(), Some(1));
    assert!(bridge.resolve(70).unwrap().ptr_eq(&handler));
}

#[tokio::test]
async fn test_invocation_of_unknown_ffid_answers_with_error() {
    let (_bridge, remote) = common::start();

    remote.send(json!({ "r": 902, "action": "get", "ffid": 404, "key": "x" })).await.unwrap();
    let response = remote.recv().await.expect("No response");
    assert_eq!(response["r"], json!(902));
    assert_eq!(response["error"]["name"], json!("UnknownReference"));
}

// --- Test 6: Timeouts ---

#[tokio::test]
async fn test_timeout_then_late_reply_is_discarded() {
    let config = common::config().with_ipc_timeout(Duration::from_millis(50));
    let (bridge, remote) = common::start_with(config);
    let global = bridge.global();

    let slow = global.clone();
    let task = tokio::spawn(async move { slow.get("slow").await });
    let request = answer_nothing(&remote).await;

    match task.await.unwrap() {
        Err(Error::Timeout { action, ffid, key, loop_stopped, .. }) => {
            assert_eq!(action, exowire::Action::Get);
            assert_eq!(ffid, 0);
            assert_eq!(key, "slow");
            assert!(!loop_stopped);
        }
        other => panic!("Expected timeout, got {:?}", other),
    }

    // the late reply is dropped and the loop keeps going
    remote.reply(r(&request), "num", json!(1)).await.unwrap();
    let task = tokio::spawn(async move { global.get("fast").await });
    answer_get(&remote, "fast", "num", json!(2)).await;
    assert_eq!(task.await.unwrap().unwrap().as_i64(), Some(2));
    assert_eq!(bridge.session().registry().pending_count(), 0);
}

async fn answer_nothing(remote: &exobridge::mock_transport::FakeRemote) -> serde_json::Value {
    expect(remote, "get").await
}

#[tokio::test]
async fn test_call_timeout_option() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move {
        let wait = global.get("wait").await?.into_proxy()?;
        wait.call_with(vec![], CallOptions::default().with_timeout(Duration::from_millis(30))).await
    });
    answer_get(&remote, "wait", "fn", json!(2)).await;
    expect(&remote, "call").await;

    assert!(matches!(task.await.unwrap(), Err(Error::Timeout { .. })));
}

// --- Test 7: Out-of-order replies ---

#[tokio::test]
async fn test_out_of_order_replies_reach_their_callers() {
    let (bridge, remote) = common::start();

    let names = ["alpha", "beta", "gamma", "delta", "epsilon"];
    let tasks: Vec<_> = names
        .iter()
        .map(|name| {
            let global = bridge.global();
            let name = name.to_string();
            tokio::spawn(async move { global.get(name.as_str()).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in names {
        requests.push(expect(&remote, "get").await);
    }
    requests.shuffle(&mut rand::thread_rng());
    for request in &requests {
        let key = request["key"].clone();
        remote.reply(r(request), "string", key).await.unwrap();
    }

    for (task, name) in tasks.into_iter().zip(names) {
        let value = task.await.unwrap().expect("Get failed");
        assert_eq!(value.as_str(), Some(name));
    }
}

// --- Test 8: Remote errors ---

#[tokio::test]
async fn test_remote_error_carries_name_and_message() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move { global.get("explode").await });
    let request = expect(&remote, "get").await;
    remote.reply_error(r(&request), "boom", "TypeError").await.unwrap();

    match task.await.unwrap() {
        Err(Error::Remote { key, failure }) => {
            assert_eq!(key, "explode");
            assert_eq!(failure.message, "boom");
            assert_eq!(failure.type_name.as_deref(), Some("TypeError"));
        }
        other => panic!("Expected remote error, got {:?}", other),
    }
}

// --- Test 9: Iteration ---

#[tokio::test]
async fn test_iterate_by_length() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move {
        let list = global.get("list").await?.into_proxy()?;
        list.iter().await?.collect().await
    });

    answer_get(&remote, "list", "obj", json!(11)).await;
    let length = answer_get(&remote, "length", "num", json!(3)).await;
    assert_eq!(length["ffid"], json!(11));
    for index in 0..3u64 {
        let request = expect(&remote, "get").await;
        assert_eq!(request["ffid"], json!(11));
        assert_eq!(request["key"], json!(index));
        remote.reply(r(&request), "num", json!(index * 100)).await.unwrap();
    }

    let values = task.await.unwrap().expect("Iteration failed");
    let values: Vec<_> = values.iter().filter_map(Value::as_i64).collect();
    assert_eq!(values, vec![0, 100, 200]);
    assert!(remote.recv_within(Duration::from_millis(50)).await.is_none());
}

#[tokio::test]
async fn test_iterate_by_keys_takes_one_round_trip() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move {
        let record = global.get("record").await?.into_proxy()?;
        let keys: Vec<Value> = record.iter().await?.into_stream().try_collect().await?;
        Ok::<_, Error>(keys)
    });

    answer_get(&remote, "record", "obj", json!(12)).await;
    answer_get(&remote, "length", "undefined", json!(null)).await;
    let keys = expect(&remote, "keys").await;
    assert_eq!(keys, json!({ "r": r(&keys), "action": "keys", "ffid": 12 }));
    remote.send(json!({ "r": r(&keys), "keys": ["a", "b"] })).await.unwrap();

    let keys = task.await.unwrap().expect("Iteration failed");
    let keys: Vec<_> = keys.iter().filter_map(Value::as_str).collect();
    assert_eq!(keys, vec!["a", "b"]);
    assert!(remote.recv_within(Duration::from_millis(50)).await.is_none());
}

// --- Test 10: Constructors ---

#[tokio::test]
async fn test_new_issues_init_against_call_target() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move {
        let widget = global.get("Widget").await?.into_proxy()?;
        let ctor = widget.get("new").await?.into_proxy()?;
        assert!(ctor.is_constructor());
        ctor.call(vec![Value::from(1i64)]).await
    });

    answer_get(&remote, "Widget", "fn", json!(40)).await;
    // `new` costs no round trip
    let init = expect(&remote, "init").await;
    assert_eq!(init["ffid"], json!(0));
    assert_eq!(init["key"], json!("Widget"));
    assert_eq!(init["args"], json!([1]));
    remote.reply(r(&init), "inst", json!(41)).await.unwrap();

    let instance = task.await.unwrap().expect("Construction failed").into_proxy().unwrap();
    assert_eq!(instance.ffid(), 41);
    assert!(!instance.is_constructor());
}

#[tokio::test]
async fn test_class_reference_constructs_on_call() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move {
        let class = global.get("Point").await?.into_proxy()?;
        assert!(class.is_constructor());
        class.call(vec![]).await
    });

    answer_get(&remote, "Point", "class", json!(42)).await;
    let init = expect(&remote, "init").await;
    assert_eq!(init["ffid"], json!(42));
    assert_eq!(init["key"], json!(""));
    remote.reply(r(&init), "inst", json!(43)).await.unwrap();

    assert!(task.await.unwrap().is_ok());
}

// --- Test 11: Reserved names, membership, materialization ---

#[tokio::test]
async fn test_reserved_names_stay_local() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    global.set("_es6", true).await.expect("Local set failed");
    assert_eq!(global.get("_es6").await.unwrap().as_bool(), Some(true));
    assert_eq!(global.get("ffid").await.unwrap().as_i64(), Some(0));
    assert!(remote.recv_within(Duration::from_millis(50)).await.is_none());
}

#[tokio::test]
async fn test_contains_treats_null_as_absent() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move {
        Ok::<_, Error>((global.contains("present").await?, global.contains("nullish").await?))
    });
    answer_get(&remote, "present", "num", json!(0)).await;
    answer_get(&remote, "nullish", "val", json!(null)).await;

    assert_eq!(task.await.unwrap().unwrap(), (true, false));
}

#[tokio::test]
async fn test_value_of_blob_and_inspect() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let task = tokio::spawn(async move {
        let json = global.value_of().await?;
        let bytes = global.blob().await?;
        let text = global.inspect(InspectMode::Repr).await?;
        Ok::<_, Error>((json, bytes, text))
    });

    let serialize = expect(&remote, "serialize").await;
    remote.reply(r(&serialize), "string", json!("{\"x\":[1,2]}")).await.unwrap();
    let blob = expect(&remote, "blob").await;
    remote.send(json!({ "r": r(&blob), "blob": "AAEC" })).await.unwrap();
    let inspect = expect(&remote, "inspect").await;
    assert_eq!(inspect["key"], json!("repr"));
    remote.reply(r(&inspect), "string", json!("[Object: global]")).await.unwrap();

    let (json, bytes, text) = task.await.unwrap().expect("Materialization failed");
    assert_eq!(json, json!({ "x": [1, 2] }));
    assert_eq!(bytes, vec![0, 1, 2]);
    assert_eq!(text, "[Object: global]");
}

// --- Test 12: Force-refs evaluation ---

#[tokio::test]
async fn test_eval_adopts_everything_but_primitives() {
    let (bridge, remote) = common::start();
    let global = bridge.global();

    let thing_task = tokio::spawn(async move { global.get("thing").await });
    answer_get(&remote, "thing", "obj", json!(70)).await;
    let thing = thing_task.await.unwrap().unwrap();

    let mut env = BTreeMap::new();
    env.insert("a".to_string(), Value::from(5i64));
    env.insert("b".to_string(), thing);

    let task = tokio::spawn(async move { bridge.eval("a + b.x", env).await });
    answer_get(&remote, "evaluateWithContext", "fn", json!(80)).await;
    let call = expect(&remote, "call").await;
    assert_eq!(call["key"], json!("evaluateWithContext"));
    // b already has ffid 70 but goes through adoption anyway
    assert_eq!(call["args"], json!(["a + b.x", { "a": 5, "b": { "r": 1, "ffid": "" } }]));
    assert_eq!(call["p"], json!(1));

    remote.assign(r(&call), &[(1, 71)]).await.unwrap();
    remote.reply(r(&call), "num", json!(6)).await.unwrap();
    assert_eq!(task.await.unwrap().unwrap().as_i64(), Some(6));
}

// --- Test 13: Remote handle trait ---

#[tokio::test]
async fn test_remote_handle_dispatch() {
    let (bridge, remote) = common::start();
    let handle: Box<dyn RemoteHandle> = Box::new(bridge.global());

    let task = tokio::spawn(async move {
        handle.set(exobridge::Key::from("x"), Value::from(1i64)).await?;
        handle.get(exobridge::Key::Index(0)).await
    });

    let set = expect(&remote, "set").await;
    assert_eq!(set["key"], json!("x"));
    remote.reply(r(&set), "void", json!(null)).await.unwrap();
    let get = expect(&remote, "get").await;
    assert_eq!(get["key"], json!(0));
    remote.reply(r(&get), "num", json!(9)).await.unwrap();

    assert_eq!(task.await.unwrap().unwrap().as_i64(), Some(9));
}

// --- Test 14: Concurrent callers ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_on_many_threads() {
    let (bridge, remote) = common::start();

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let global = bridge.global();
            tokio::spawn(async move { global.get(format!("k{}", i)).await })
        })
        .collect();

    let mut answered = HashMap::new();
    for _ in 0..16 {
        let request = expect(&remote, "get").await;
        let key = request["key"].as_str().unwrap().to_string();
        remote.reply(r(&request), "string", json!(key.clone())).await.unwrap();
        answered.insert(r(&request), key);
    }
    assert_eq!(answered.len(), 16);

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap().unwrap().as_str(), Some(format!("k{}", i).as_str()));
    }
}
